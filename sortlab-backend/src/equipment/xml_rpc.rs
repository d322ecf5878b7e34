//! Encoding of XML-RPC method calls and decoding of method responses.

use std::collections::BTreeMap;

use roxmltree::Node;
use serde::Serialize;
use valuable::Valuable;

#[derive(Serialize, Debug, Clone, PartialEq, Valuable)]
#[serde(untagged)]
pub enum RpcValue {
    Nil,
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
    Array(Vec<RpcValue>),
    Struct(BTreeMap<String, RpcValue>),
}

impl From<i32> for RpcValue {
    fn from(value: i32) -> Self {
        Self::Int(value.into())
    }
}

impl From<bool> for RpcValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&str> for RpcValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl RpcValue {
    fn write_xml(&self, xml: &mut String) {
        xml.push_str("<value>");

        match self {
            Self::Nil => xml.push_str("<nil/>"),
            Self::Bool(b) => {
                xml.push_str(if *b {
                    "<boolean>1</boolean>"
                } else {
                    "<boolean>0</boolean>"
                });
            }
            Self::Int(i) => {
                if i32::try_from(*i).is_ok() {
                    xml.push_str(&format!("<int>{i}</int>"));
                } else {
                    xml.push_str(&format!("<i8>{i}</i8>"));
                }
            }
            Self::Double(d) => xml.push_str(&format!("<double>{d}</double>")),
            Self::String(s) => {
                xml.push_str("<string>");
                escape_into(xml, s);
                xml.push_str("</string>");
            }
            Self::Array(values) => {
                xml.push_str("<array><data>");
                for value in values {
                    value.write_xml(xml);
                }
                xml.push_str("</data></array>");
            }
            Self::Struct(members) => {
                xml.push_str("<struct>");
                for (name, value) in members {
                    xml.push_str("<member><name>");
                    escape_into(xml, name);
                    xml.push_str("</name>");
                    value.write_xml(xml);
                    xml.push_str("</member>");
                }
                xml.push_str("</struct>");
            }
        }

        xml.push_str("</value>");
    }
}

fn escape_into(xml: &mut String, text: &str) {
    for c in text.chars() {
        match c {
            '<' => xml.push_str("&lt;"),
            '>' => xml.push_str("&gt;"),
            '&' => xml.push_str("&amp;"),
            '"' => xml.push_str("&quot;"),
            '\'' => xml.push_str("&apos;"),
            c => xml.push(c),
        }
    }
}

#[must_use]
pub fn method_call(method: &str, params: &[RpcValue]) -> String {
    let mut xml = String::from(r#"<?xml version="1.0"?><methodCall><methodName>"#);
    escape_into(&mut xml, method);
    xml.push_str("</methodName><params>");

    for param in params {
        xml.push_str("<param>");
        param.write_xml(&mut xml);
        xml.push_str("</param>");
    }

    xml.push_str("</params></methodCall>");

    xml
}

#[derive(Debug, Clone, PartialEq)]
pub enum MethodResponse {
    Success(RpcValue),
    Fault { code: i64, message: String },
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("{0}")]
pub struct ParseError(String);

fn elements<'a, 'input>(node: Node<'a, 'input>) -> impl Iterator<Item = Node<'a, 'input>> {
    node.children().filter(Node::is_element)
}

fn child<'a, 'input>(node: Node<'a, 'input>, tag: &str) -> Result<Node<'a, 'input>, ParseError> {
    elements(node).find(|n| n.has_tag_name(tag)).ok_or_else(|| {
        ParseError(format!(
            "<{}> has no <{tag}> element",
            node.tag_name().name()
        ))
    })
}

fn parse_number<T: std::str::FromStr>(text: &str, kind: &str) -> Result<T, ParseError> {
    text.trim()
        .parse()
        .map_err(|_| ParseError(format!("{text:?} is not a valid {kind}")))
}

fn parse_value(value: Node) -> Result<RpcValue, ParseError> {
    // A value without a type element is a string
    let Some(typed) = elements(value).next() else {
        return Ok(RpcValue::String(value.text().unwrap_or_default().to_string()));
    };
    let text = typed.text().unwrap_or_default();

    let parsed = match typed.tag_name().name() {
        "int" | "i4" | "i8" => RpcValue::Int(parse_number(text, "integer")?),
        "double" => RpcValue::Double(parse_number(text, "double")?),
        "boolean" => match text.trim() {
            "1" => RpcValue::Bool(true),
            "0" => RpcValue::Bool(false),
            _ => return Err(ParseError(format!("{text:?} is not a valid boolean"))),
        },
        "string" | "dateTime.iso8601" | "base64" => RpcValue::String(text.to_string()),
        "nil" => RpcValue::Nil,
        "array" => {
            let values = elements(child(typed, "data")?)
                .filter(|n| n.has_tag_name("value"))
                .map(parse_value)
                .collect::<Result<_, _>>()?;

            RpcValue::Array(values)
        }
        "struct" => {
            let mut members = BTreeMap::new();
            for member in elements(typed).filter(|n| n.has_tag_name("member")) {
                let name = child(member, "name")?.text().unwrap_or_default();
                let value = parse_value(child(member, "value")?)?;
                members.insert(name.to_string(), value);
            }

            RpcValue::Struct(members)
        }
        other => return Err(ParseError(format!("unsupported value type <{other}>"))),
    };

    Ok(parsed)
}

fn parse_fault(fault: Node) -> Result<MethodResponse, ParseError> {
    let RpcValue::Struct(mut members) = parse_value(child(fault, "value")?)? else {
        return Err(ParseError("fault value is not a struct".to_string()));
    };

    let code = match members.remove("faultCode") {
        Some(RpcValue::Int(code)) => code,
        _ => return Err(ParseError("fault has no integer faultCode".to_string())),
    };
    let message = match members.remove("faultString") {
        Some(RpcValue::String(message)) => message,
        _ => String::new(),
    };

    Ok(MethodResponse::Fault { code, message })
}

/// # Errors
pub fn parse_response(xml: &str) -> Result<MethodResponse, ParseError> {
    let doc =
        roxmltree::Document::parse(xml).map_err(|e| ParseError(format!("malformed XML: {e}")))?;

    let root = doc.root_element();
    if !root.has_tag_name("methodResponse") {
        return Err(ParseError(format!(
            "expected <methodResponse>, found <{}>",
            root.tag_name().name()
        )));
    }

    let Some(body) = elements(root).next() else {
        return Err(ParseError("empty <methodResponse>".to_string()));
    };

    match body.tag_name().name() {
        "params" => {
            // Void methods may reply without a param
            let Some(param) = elements(body).find(|n| n.has_tag_name("param")) else {
                return Ok(MethodResponse::Success(RpcValue::Nil));
            };

            Ok(MethodResponse::Success(parse_value(child(param, "value")?)?))
        }
        "fault" => parse_fault(body),
        other => Err(ParseError(format!("unexpected <{other}> in <methodResponse>"))),
    }
}
