//! XML to JSON conversion so objectives can address XML payloads with the
//! same JSON paths as API responses.
//!
//! - elements become object members named with their qualified name
//!   (`dc:title`)
//! - attributes become `@name` members
//! - text next to attributes or children becomes `#text`
//! - an element with only text becomes a plain string, an empty one `null`
//! - repeated siblings become an array

use anyhow::{Context, Result};
use quick_xml::events::{BytesStart, Event};
use serde_json::{Map, Value};

struct Frame {
    name: String,
    map: Map<String, Value>,
    text: String,
}

impl Frame {
    fn open(start: &BytesStart<'_>) -> Result<Self> {
        let name = String::from_utf8_lossy(start.name().as_ref()).to_string();
        let mut map = Map::new();
        for attr in start.attributes() {
            let attr = attr.context("invalid XML attribute")?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
            let value = attr
                .unescape_value()
                .context("invalid XML attribute value")?
                .to_string();
            map.insert(format!("@{}", key), Value::String(value));
        }
        Ok(Self {
            name,
            map,
            text: String::new(),
        })
    }

    fn close(self) -> (String, Value) {
        let text = self.text.trim().to_string();
        let value = if self.map.is_empty() {
            if text.is_empty() {
                Value::Null
            } else {
                Value::String(text)
            }
        } else {
            let mut map = self.map;
            if !text.is_empty() {
                map.insert("#text".to_string(), Value::String(text));
            }
            Value::Object(map)
        };
        (self.name, value)
    }
}

fn insert_child(parent: &mut Map<String, Value>, name: String, value: Value) {
    match parent.get_mut(&name) {
        Some(Value::Array(items)) => items.push(value),
        Some(existing) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, value]);
        }
        None => {
            parent.insert(name, value);
        }
    }
}

/// Parse an XML document into a JSON value.
pub fn xml_to_value(xml: &str) -> Result<Value> {
    let mut reader = quick_xml::Reader::from_reader(xml.as_bytes());
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut stack: Vec<Frame> = vec![Frame {
        name: String::new(),
        map: Map::new(),
        text: String::new(),
    }];

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => stack.push(Frame::open(&e)?),
            Ok(Event::Empty(e)) => {
                let (name, value) = Frame::open(&e)?.close();
                if let Some(parent) = stack.last_mut() {
                    insert_child(&mut parent.map, name, value);
                }
            }
            Ok(Event::Text(t)) => {
                let text = t.unescape().context("invalid XML text")?;
                if let Some(frame) = stack.last_mut() {
                    frame.text.push_str(&text);
                }
            }
            Ok(Event::CData(c)) => {
                if let Some(frame) = stack.last_mut() {
                    frame.text.push_str(&String::from_utf8_lossy(&c.into_inner()));
                }
            }
            Ok(Event::End(_)) => {
                if stack.len() < 2 {
                    anyhow::bail!("unbalanced XML end tag");
                }
                if let Some(frame) = stack.pop() {
                    let (name, value) = frame.close();
                    if let Some(parent) = stack.last_mut() {
                        insert_child(&mut parent.map, name, value);
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(anyhow::anyhow!(
                    "XML parse error at position {}: {}",
                    reader.buffer_position(),
                    e
                ))
            }
            _ => {}
        }
        buf.clear();
    }

    if stack.len() != 1 {
        anyhow::bail!("unexpected end of XML document");
    }
    let root = stack.pop().map(|f| f.map).unwrap_or_default();
    Ok(Value::Object(root))
}
