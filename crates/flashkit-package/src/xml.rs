//! Small element tree on top of quick-xml
//!
//! Manifests are tiny, so they are read into a tree and written back from one.
//! Mixed content is not supported: an element has text or children.

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::io;
use std::path::Path;

use crate::manifest::ManifestError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XmlElement {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub text: String,
    pub children: Vec<XmlElement>,
}

impl XmlElement {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_attribute(mut self, key: &str, value: impl ToString) -> Self {
        self.attributes.push((key.to_string(), value.to_string()));
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn with_child(mut self, child: XmlElement) -> Self {
        self.children.push(child);
        self
    }

    pub fn push(&mut self, child: XmlElement) {
        self.children.push(child);
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn child(&self, name: &str) -> Option<&XmlElement> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlElement> {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Text of a mandatory child element
    pub fn child_text(&self, name: &str) -> Result<&str, ManifestError> {
        self.child(name)
            .map(|c| c.text.as_str())
            .ok_or_else(|| ManifestError::Corrupt(format!("<{}> lacks <{}>", self.name, name)))
    }

    pub fn parse(text: &str) -> Result<Self, ManifestError> {
        let mut reader = Reader::from_str(text);
        reader.config_mut().trim_text(true);

        let mut stack: Vec<XmlElement> = Vec::new();
        let mut root: Option<XmlElement> = None;

        loop {
            match reader.read_event() {
                Ok(Event::Start(start)) => stack.push(element_from(&start)?),
                Ok(Event::Empty(start)) => {
                    let element = element_from(&start)?;
                    attach(&mut stack, &mut root, element)?;
                }
                Ok(Event::Text(text)) => {
                    let text = text
                        .unescape()
                        .map_err(|e| ManifestError::Xml(e.to_string()))?;
                    if let Some(top) = stack.last_mut() {
                        top.text.push_str(&text);
                    }
                }
                Ok(Event::CData(data)) => {
                    let text = String::from_utf8_lossy(&data.into_inner()).into_owned();
                    if let Some(top) = stack.last_mut() {
                        top.text.push_str(&text);
                    }
                }
                Ok(Event::End(_)) => {
                    let element = stack
                        .pop()
                        .ok_or_else(|| ManifestError::Xml("unbalanced end tag".into()))?;
                    attach(&mut stack, &mut root, element)?;
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => return Err(ManifestError::Xml(e.to_string())),
            }
        }

        if let Some(open) = stack.last() {
            return Err(ManifestError::Xml(format!("unclosed element <{}>", open.name)));
        }
        root.ok_or_else(|| ManifestError::Xml("document has no root element".into()))
    }

    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Serialize as an indented document with XML declaration
    pub fn to_document(&self) -> Result<String, ManifestError> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
        self.write_into(&mut writer)?;
        String::from_utf8(writer.into_inner()).map_err(|e| ManifestError::Xml(e.to_string()))
    }

    pub fn save(&self, path: &Path) -> Result<(), ManifestError> {
        std::fs::write(path, self.to_document()?)?;
        Ok(())
    }

    fn write_into(&self, writer: &mut Writer<Vec<u8>>) -> io::Result<()> {
        let mut start = BytesStart::new(self.name.as_str());
        for (key, value) in &self.attributes {
            start.push_attribute((key.as_str(), value.as_str()));
        }

        if self.children.is_empty() && self.text.is_empty() {
            return writer.write_event(Event::Empty(start));
        }

        writer.write_event(Event::Start(start))?;
        if !self.text.is_empty() {
            writer.write_event(Event::Text(BytesText::new(&self.text)))?;
        }
        for child in &self.children {
            child.write_into(writer)?;
        }
        writer.write_event(Event::End(BytesEnd::new(self.name.as_str())))
    }
}

fn element_from(start: &BytesStart<'_>) -> Result<XmlElement, ManifestError> {
    let mut element = XmlElement::new(String::from_utf8_lossy(start.name().as_ref()));
    for attribute in start.attributes().with_checks(false) {
        let attribute = attribute.map_err(|e| ManifestError::Xml(e.to_string()))?;
        let key = String::from_utf8_lossy(attribute.key.as_ref()).into_owned();
        let value = attribute
            .unescape_value()
            .map_err(|e| ManifestError::Xml(e.to_string()))?
            .into_owned();
        element.attributes.push((key, value));
    }
    Ok(element)
}

fn attach(
    stack: &mut [XmlElement],
    root: &mut Option<XmlElement>,
    element: XmlElement,
) -> Result<(), ManifestError> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(element),
        None if root.is_some() => {
            return Err(ManifestError::Xml("more than one root element".into()));
        }
        None => *root = Some(element),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tree() {
        let doc = r#"<?xml version="1.0"?>
            <!-- comment -->
            <root version="2">
              <item name="a &amp; b">first</item>
              <item name="c"/>
              <nested><leaf>x</leaf></nested>
            </root>"#;

        let root = XmlElement::parse(doc).unwrap();
        assert_eq!(root.name, "root");
        assert_eq!(root.attribute("version"), Some("2"));

        let items: Vec<_> = root.children_named("item").collect();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].attribute("name"), Some("a & b"));
        assert_eq!(items[0].text, "first");
        assert_eq!(root.child("nested").unwrap().child_text("leaf").unwrap(), "x");
    }

    #[test]
    fn test_write_and_reparse() {
        let element = XmlElement::new("package")
            .with_attribute("count", 2)
            .with_child(XmlElement::new("path").with_text("Node<1>/app.hex"))
            .with_child(XmlElement::new("flag").with_attribute("enabled", true));

        let document = element.to_document().unwrap();
        assert!(document.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(document.contains("Node&lt;1&gt;/app.hex"));
        assert_eq!(XmlElement::parse(&document).unwrap(), element);
    }

    #[test]
    fn test_malformed_documents() {
        assert!(XmlElement::parse("").is_err());
        assert!(XmlElement::parse("<a><b></a>").is_err());
        assert!(XmlElement::parse("<a>").is_err());
        assert!(XmlElement::parse("<a/><b/>").is_err());
    }

    #[test]
    fn test_missing_child_is_corrupt() {
        let root = XmlElement::parse("<root/>").unwrap();
        assert!(matches!(root.child_text("x"), Err(ManifestError::Corrupt(_))));
    }
}
