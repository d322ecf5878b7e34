use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{
    Error, Result,
    xml_rpc::{self, MethodResponse, RpcValue},
};

/// A connection to the sorting line controller that issues one remote call at a time and never retries.
pub trait EquipmentLink {
    fn call(
        &self,
        method: &str,
        args: &[RpcValue],
    ) -> impl Future<Output = Result<RpcValue>> + Send;
}

#[derive(Clone, Debug)]
pub struct XmlRpcLink {
    http_client: reqwest::Client,
    endpoint: Url,
    timeout: Duration,
    cancel: CancellationToken,
}

impl XmlRpcLink {
    #[must_use]
    pub fn new(endpoint: Url, timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            http_client: reqwest::Client::new(),
            endpoint,
            timeout,
            cancel,
        }
    }

    #[must_use]
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    async fn post(&self, method: &str, body: String) -> Result<RpcValue> {
        let transport_error = |err: reqwest::Error| Error::Transport {
            method: method.to_string(),
            message: err.to_string(),
        };

        let reply = self
            .http_client
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, "text/xml")
            .body(body)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(transport_error)?
            .text()
            .await
            .map_err(transport_error)?;

        match xml_rpc::parse_response(&reply) {
            Ok(MethodResponse::Success(value)) => Ok(value),
            Ok(MethodResponse::Fault { code, message }) => Err(Error::Fault {
                method: method.to_string(),
                code,
                message,
            }),
            Err(err) => Err(Error::Protocol {
                method: method.to_string(),
                message: err.to_string(),
            }),
        }
    }
}

impl EquipmentLink for XmlRpcLink {
    async fn call(&self, method: &str, args: &[RpcValue]) -> Result<RpcValue> {
        let body = xml_rpc::method_call(method, args);
        tracing::debug!(method, endpoint = %self.endpoint, "calling equipment");

        tokio::select! {
            () = self.cancel.cancelled() => Err(Error::Cancelled { method: method.to_string() }),
            result = tokio::time::timeout(self.timeout, self.post(method, body)) => {
                result.unwrap_or_else(|_| Err(Error::Timeout {
                    method: method.to_string(),
                    timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use tokio_util::sync::CancellationToken;
    use url::Url;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{body_string_contains, header, method, path},
    };

    use super::{EquipmentLink, XmlRpcLink};
    use crate::equipment::{Error, RpcValue};

    const TRUE_REPLY: &str = "<?xml version='1.0'?><methodResponse><params><param><value><boolean>1</boolean></value></param></params></methodResponse>";

    fn link(server: &MockServer, timeout: Duration) -> XmlRpcLink {
        let endpoint = Url::parse(&format!("{}/RPC2", server.uri())).unwrap();

        XmlRpcLink::new(endpoint, timeout, CancellationToken::new())
    }

    #[tokio::test]
    async fn call_posts_xml_and_decodes_reply() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/RPC2"))
            .and(header("Content-Type", "text/xml"))
            .and(body_string_contains(
                "<methodName>set_plc_job</methodName><params><param><value><int>2101</int></value>",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_string(TRUE_REPLY))
            .expect(1)
            .mount(&server)
            .await;

        let reply = link(&server, Duration::from_secs(5))
            .call("set_plc_job", &[RpcValue::from(2101)])
            .await
            .unwrap();

        assert_eq!(reply, RpcValue::Bool(true));
    }

    #[tokio::test]
    async fn fault_reply_is_an_error() {
        let server = MockServer::start().await;
        let fault = "<methodResponse><fault><value><struct>\
            <member><name>faultCode</name><value><int>1</int></value></member>\
            <member><name>faultString</name><value><string>no such method</string></value></member>\
            </struct></value></fault></methodResponse>";

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string(fault))
            .mount(&server)
            .await;

        let err = link(&server, Duration::from_secs(5))
            .call("clear_ur_sorting_ramp", &[])
            .await
            .unwrap_err();

        assert_eq!(
            err,
            Error::Fault {
                method: "clear_ur_sorting_ramp".to_string(),
                code: 1,
                message: "no such method".to_string()
            }
        );
    }

    #[tokio::test]
    async fn http_failure_is_a_transport_error() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let err = link(&server, Duration::from_secs(5))
            .call("set_ur_job", &[RpcValue::from(2302)])
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Transport { .. }));
        assert_eq!(err.method(), "set_ur_job");
    }

    #[tokio::test]
    async fn garbage_reply_is_a_protocol_error() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>gateway</html>"))
            .mount(&server)
            .await;

        let err = link(&server, Duration::from_secs(5))
            .call("set_ur_job", &[])
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Protocol { .. }));
    }

    #[tokio::test]
    async fn slow_reply_times_out() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(TRUE_REPLY)
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let err = link(&server, Duration::from_millis(100))
            .call("set_plc_job", &[])
            .await
            .unwrap_err();

        assert_eq!(
            err,
            Error::Timeout {
                method: "set_plc_job".to_string(),
                timeout_ms: 100
            }
        );
    }

    #[tokio::test]
    async fn cancelled_link_refuses_calls() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(TRUE_REPLY)
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let cancel = CancellationToken::new();
        let endpoint = Url::parse(&format!("{}/RPC2", server.uri())).unwrap();
        let link = XmlRpcLink::new(endpoint, Duration::from_secs(5), cancel.clone());

        let call = tokio::spawn(async move { link.call("set_plc_job", &[]).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let err = call.await.unwrap().unwrap_err();
        assert_eq!(
            err,
            Error::Cancelled {
                method: "set_plc_job".to_string()
            }
        );
    }
}
