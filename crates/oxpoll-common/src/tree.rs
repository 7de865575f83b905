//! Ordered tree of named nodes.
//!
//! Collector templates and the instance-detail documents returned by the
//! XML transport are both expressed as this tree. Children keep insertion
//! order, which downstream code relies on when assembling instance keys.
//! Nodes are plain values; when a traversal needs the parent it is passed
//! explicitly on the stack.

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Node {
    name: String,
    content: String,
    children: Vec<Node>,
}

impl Node {
    pub fn new(name: impl Into<String>) -> Self {
        Node {
            name: name.into(),
            content: String::new(),
            children: Vec::new(),
        }
    }

    pub fn with_content(name: impl Into<String>, content: impl Into<String>) -> Self {
        Node {
            name: name.into(),
            content: content.into(),
            children: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn set_content(&mut self, content: impl Into<String>) {
        self.content = content.into();
    }

    /// Appends a child and returns a mutable handle to it.
    pub fn new_child(
        &mut self,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> &mut Node {
        self.children.push(Node::with_content(name, content));
        self.children.last_mut().unwrap_or_else(|| unreachable!())
    }

    pub fn push_child(&mut self, child: Node) {
        self.children.push(child);
    }

    pub fn has_child(&self, name: &str) -> bool {
        self.children.iter().any(|c| c.name == name)
    }

    /// First child with the given name, if any.
    pub fn get_child(&self, name: &str) -> Option<&Node> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn get_child_mut(&mut self, name: &str) -> Option<&mut Node> {
        self.children.iter_mut().find(|c| c.name == name)
    }

    pub fn get_child_content(&self, name: &str) -> Option<&str> {
        self.get_child(name).map(Node::content)
    }

    /// Content of every direct child, in insertion order. List-shaped
    /// template sections (children with empty names) are read this way.
    pub fn get_all_child_content(&self) -> Vec<&str> {
        self.children.iter().map(Node::content).collect()
    }

    pub fn iter_children(&self) -> impl Iterator<Item = &Node> {
        self.children.iter()
    }

    pub fn children_len(&self) -> usize {
        self.children.len()
    }

    /// Lifts a YAML document into a tree. Mappings become named children,
    /// sequences become unnamed children carrying their scalar content,
    /// scalars become content.
    pub fn from_yaml_str(name: &str, doc: &str) -> Result<Node> {
        let value: serde_yaml::Value = serde_yaml::from_str(doc)?;
        let mut root = Node::new(name);
        lift_yaml(&mut root, &value)?;
        Ok(root)
    }
}

fn lift_yaml(node: &mut Node, value: &serde_yaml::Value) -> Result<()> {
    use serde_yaml::Value;

    match value {
        Value::Null => {}
        Value::Bool(b) => node.set_content(b.to_string()),
        Value::Number(n) => node.set_content(n.to_string()),
        Value::String(s) => node.set_content(s.clone()),
        Value::Sequence(items) => {
            for item in items {
                let child = node.new_child("", "");
                lift_yaml(child, item)?;
            }
        }
        Value::Mapping(map) => {
            for (key, val) in map {
                let name = match key {
                    Value::String(s) => s.clone(),
                    Value::Number(n) => n.to_string(),
                    Value::Bool(b) => b.to_string(),
                    other => {
                        return Err(Error::Config(format!(
                            "unsupported mapping key in template: {other:?}"
                        )))
                    }
                };
                let child = node.new_child(name, "");
                lift_yaml(child, val)?;
            }
        }
        Value::Tagged(tagged) => lift_yaml(node, &tagged.value)?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn children_keep_insertion_order() {
        let mut n = Node::new("labels");
        n.new_child("org", "abc");
        n.new_child("site", "RTP");
        n.new_child("floor", "3");

        let names: Vec<&str> = n.iter_children().map(Node::name).collect();
        assert_eq!(names, ["org", "site", "floor"]);
        assert_eq!(n.get_child_content("site"), Some("RTP"));
    }

    #[test]
    fn get_child_returns_first_match() {
        let mut n = Node::new("root");
        n.new_child("a", "1");
        n.new_child("a", "2");
        assert_eq!(n.get_child("a").map(Node::content), Some("1"));
        assert!(n.get_child("b").is_none());
    }

    #[test]
    fn yaml_mapping_and_sequence_lift() {
        let doc = r#"
name: Volume
query: api/storage/volumes
counters:
  - ^^uuid
  - ^name
  - space.used
export_options:
  instance_keys:
    - volume
"#;
        let root = Node::from_yaml_str("template", doc).unwrap();
        assert_eq!(root.get_child_content("name"), Some("Volume"));

        let counters = root.get_child("counters").unwrap();
        assert_eq!(
            counters.get_all_child_content(),
            ["^^uuid", "^name", "space.used"]
        );

        let keys = root
            .get_child("export_options")
            .and_then(|e| e.get_child("instance_keys"))
            .unwrap();
        assert_eq!(keys.get_all_child_content(), ["volume"]);
    }

    #[test]
    fn yaml_scalars_become_content() {
        let root = Node::from_yaml_str("t", "latency_io_reqd: 10").unwrap();
        assert_eq!(root.get_child_content("latency_io_reqd"), Some("10"));
    }
}
