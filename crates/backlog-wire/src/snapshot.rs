//! Captured state of a suspended message.
//!
//! The engine reports a suspended message as a `backlogTracerEventMessage` XML
//! document:
//!
//! ```xml
//! <backlogTracerEventMessage>
//!   <uid>1</uid>
//!   <timestamp>2022-01-17T14:33:04.001+0100</timestamp>
//!   <routeId>foo</routeId>
//!   <toNode>bean1</toNode>
//!   <exchangeId>8740E46AD27758F-000000000000000C</exchangeId>
//!   <message exchangeId="8740E46AD27758F-000000000000000C">
//!     <headers><header key="a" type="java.lang.String">b</header></headers>
//!     <body>[Body is null]</body>
//!   </message>
//!   <exchangeProperties>
//!     <exchangeProperty name="p" type="java.lang.String">v</exchangeProperty>
//!   </exchangeProperties>
//! </backlogTracerEventMessage>
//! ```

use roxmltree::{Document, Node};

use crate::types::{BacklogError, Result};

pub const ROOT_ELEMENT: &str = "backlogTracerEventMessage";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub key: String,
    pub type_name: Option<String>,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeProperty {
    pub name: String,
    pub type_name: Option<String>,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeVariable {
    pub key: String,
    pub type_name: Option<String>,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessageSnapshot {
    pub uid: i64,
    pub timestamp: String,
    pub route_id: String,
    pub to_node: String,
    /// Correlation key of the in-flight message.
    pub exchange_id: String,
    pub headers: Vec<MessageHeader>,
    pub body: Option<String>,
    pub exchange_properties: Vec<ExchangeProperty>,
    pub exchange_variables: Vec<ExchangeVariable>,
}

impl MessageSnapshot {
    pub fn parse(xml: &str) -> Result<Self> {
        let doc = Document::parse(xml.trim())
            .map_err(|err| BacklogError::Snapshot(err.to_string()))?;
        let root = doc.root_element();
        if root.tag_name().name() != ROOT_ELEMENT {
            return Err(BacklogError::Snapshot(format!(
                "expected <{ROOT_ELEMENT}>, found <{}>",
                root.tag_name().name()
            )));
        }

        let uid = match child_text(root, "uid") {
            Some(text) => text
                .trim()
                .parse::<i64>()
                .map_err(|err| BacklogError::Snapshot(format!("invalid uid {text:?}: {err}")))?,
            None => 0,
        };
        let exchange_id = child_text(root, "exchangeId").unwrap_or_default();
        if exchange_id.is_empty() {
            return Err(BacklogError::Snapshot("missing exchangeId".to_string()));
        }

        let message = child(root, "message");
        let headers = message
            .and_then(|message| child(message, "headers"))
            .map(|headers| {
                elements(headers, "header")
                    .map(|header| MessageHeader {
                        key: header.attribute("key").unwrap_or_default().to_string(),
                        type_name: header.attribute("type").map(str::to_string),
                        value: text_of(header),
                    })
                    .collect()
            })
            .unwrap_or_default();
        let body = message.and_then(|message| child(message, "body")).map(text_of);

        // Newer engines report properties at the top level; older ones nest
        // them inside <message>.
        let properties = child(root, "exchangeProperties")
            .or_else(|| message.and_then(|message| child(message, "exchangeProperties")));
        let exchange_properties = properties
            .map(|properties| {
                elements(properties, "exchangeProperty")
                    .map(|property| ExchangeProperty {
                        name: property
                            .attribute("name")
                            .or_else(|| property.attribute("key"))
                            .unwrap_or_default()
                            .to_string(),
                        type_name: property.attribute("type").map(str::to_string),
                        value: text_of(property),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let variables = child(root, "exchangeVariables")
            .or_else(|| message.and_then(|message| child(message, "exchangeVariables")));
        let exchange_variables = variables
            .map(|variables| {
                elements(variables, "exchangeVariable")
                    .map(|variable| ExchangeVariable {
                        key: variable.attribute("key").unwrap_or_default().to_string(),
                        type_name: variable.attribute("type").map(str::to_string),
                        value: text_of(variable),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            uid,
            timestamp: child_text(root, "timestamp").unwrap_or_default(),
            route_id: child_text(root, "routeId").unwrap_or_default(),
            to_node: child_text(root, "toNode").unwrap_or_default(),
            exchange_id,
            headers,
            body,
            exchange_properties,
            exchange_variables,
        })
    }

    pub fn header(&self, key: &str) -> Option<&MessageHeader> {
        self.headers.iter().find(|header| header.key == key)
    }

    pub fn property(&self, name: &str) -> Option<&ExchangeProperty> {
        self.exchange_properties
            .iter()
            .find(|property| property.name == name)
    }

    /// Render the snapshot in the engine's XML dump format.
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("<{ROOT_ELEMENT}>\n"));
        out.push_str(&format!("  <uid>{}</uid>\n", self.uid));
        push_element(&mut out, "timestamp", &self.timestamp);
        push_element(&mut out, "routeId", &self.route_id);
        push_element(&mut out, "toNode", &self.to_node);
        push_element(&mut out, "exchangeId", &self.exchange_id);
        out.push_str(&format!(
            "  <message exchangeId=\"{}\">\n    <headers>\n",
            escape(&self.exchange_id)
        ));
        for header in &self.headers {
            out.push_str(&format!(
                "      <header key=\"{}\"{}>{}</header>\n",
                escape(&header.key),
                type_attribute(header.type_name.as_deref()),
                escape(&header.value)
            ));
        }
        out.push_str("    </headers>\n");
        if let Some(body) = &self.body {
            out.push_str(&format!("    <body>{}</body>\n", escape(body)));
        }
        out.push_str("  </message>\n  <exchangeProperties>\n");
        for property in &self.exchange_properties {
            out.push_str(&format!(
                "    <exchangeProperty name=\"{}\"{}>{}</exchangeProperty>\n",
                escape(&property.name),
                type_attribute(property.type_name.as_deref()),
                escape(&property.value)
            ));
        }
        out.push_str("  </exchangeProperties>\n");
        if !self.exchange_variables.is_empty() {
            out.push_str("  <exchangeVariables>\n");
            for variable in &self.exchange_variables {
                out.push_str(&format!(
                    "    <exchangeVariable key=\"{}\"{}>{}</exchangeVariable>\n",
                    escape(&variable.key),
                    type_attribute(variable.type_name.as_deref()),
                    escape(&variable.value)
                ));
            }
            out.push_str("  </exchangeVariables>\n");
        }
        out.push_str(&format!("</{ROOT_ELEMENT}>"));
        out
    }
}

fn child<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    node.children()
        .find(|child| child.is_element() && child.tag_name().name() == name)
}

fn elements<'a, 'input: 'a>(
    node: Node<'a, 'input>,
    name: &'a str,
) -> impl Iterator<Item = Node<'a, 'input>> + 'a {
    node.children()
        .filter(move |child| child.is_element() && child.tag_name().name() == name)
}

fn child_text(node: Node<'_, '_>, name: &str) -> Option<String> {
    child(node, name).map(text_of)
}

fn text_of(node: Node<'_, '_>) -> String {
    node.children()
        .filter(|child| child.is_text())
        .filter_map(|child| child.text())
        .collect()
}

fn push_element(out: &mut String, name: &str, value: &str) {
    out.push_str(&format!("  <{name}>{}</{name}>\n", escape(value)));
}

fn type_attribute(type_name: Option<&str>) -> String {
    type_name
        .map(|type_name| format!(" type=\"{}\"", escape(type_name)))
        .unwrap_or_default()
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
    out
}
