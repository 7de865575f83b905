//! Legacy XML/RPC transport. Requests are built from a [`Node`] tree,
//! responses are parsed back into one. Element attributes are folded
//! into children so the tree stays a plain value type.

use crate::client::{build_http_client, classify_status, classify_transport};
use crate::recorder::Recorder;
use oxpoll_common::config::{AuthStyle, Credentials};
use oxpoll_common::error::{Error, Result};
use oxpoll_common::tree::Node;
use quick_xml::events::Event;
use quick_xml::Reader;
use std::fmt::Write as _;

const SERVLET_PATH: &str = "servlets/netapp.servlets.admin.XMLrequest_filer";
const API_VERSION: &str = "1.180";

pub struct ZapiClient {
    url: String,
    http: reqwest::Client,
    credentials: Credentials,
    recorder: Option<Recorder>,
}

impl ZapiClient {
    pub fn new(
        addr: &str,
        credentials: Credentials,
        timeout_secs: u64,
        use_insecure_tls: bool,
        recorder: Option<Recorder>,
    ) -> Result<Self> {
        let http = build_http_client(&credentials, timeout_secs, use_insecure_tls)?;
        Ok(ZapiClient {
            url: format!("https://{addr}/{SERVLET_PATH}"),
            http,
            credentials,
            recorder,
        })
    }

    /// Invokes one API and returns its `results` element. A response
    /// whose status is not `passed` fails with the remote's reason.
    pub async fn invoke(&mut self, request: &Node) -> Result<Node> {
        let body = wrap_request(request);
        let text = self.post(body).await?;

        let document = parse_document(&text)?;
        let results = document
            .get_child("results")
            .ok_or_else(|| Error::Protocol(format!("{}: response has no results", request.name())))?;

        match results.get_child_content("status") {
            Some("passed") => Ok(results.clone()),
            _ => {
                let reason = results.get_child_content("reason").unwrap_or("unknown");
                let errno = results.get_child_content("errno").unwrap_or("");
                Err(Error::Protocol(format!(
                    "{} failed: {reason} (errno={errno})",
                    request.name()
                )))
            }
        }
    }

    async fn post(&mut self, body: String) -> Result<String> {
        if let Some(recorder) = self.recorder.as_mut() {
            if recorder.is_replay() {
                return recorder.next_response();
            }
        }

        let mut request = self
            .http
            .post(&self.url)
            .header("Content-Type", "text/xml")
            .body(body);
        if self.credentials.auth_style == AuthStyle::BasicAuth {
            request = request.basic_auth(&self.credentials.username, Some(&self.credentials.password));
        }

        let response = request
            .send()
            .await
            .map_err(|e| classify_transport(&self.url, e))?;
        if let Some(err) = classify_status(&self.url, response.status()) {
            return Err(err);
        }
        let text = response
            .text()
            .await
            .map_err(|e| classify_transport(&self.url, e))?;

        if let Some(recorder) = self.recorder.as_mut() {
            recorder.record(&text)?;
        }
        Ok(text)
    }
}

fn wrap_request(request: &Node) -> String {
    format!(
        "<?xml version=\"1.0\"?><netapp version=\"{API_VERSION}\" \
         xmlns=\"http://www.netapp.com/filer/admin\">{}</netapp>",
        node_to_xml(request)
    )
}

pub fn node_to_xml(node: &Node) -> String {
    let mut out = String::new();
    write_node(&mut out, node);
    out
}

fn write_node(out: &mut String, node: &Node) {
    let name = node.name();
    if node.content().is_empty() && node.children_len() == 0 {
        let _ = write!(out, "<{name}/>");
        return;
    }
    let _ = write!(out, "<{name}>{}", escape_text(node.content()));
    for child in node.iter_children() {
        write_node(out, child);
    }
    let _ = write!(out, "</{name}>");
}

fn escape_text(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Parses an XML document into a tree. Attributes become leading
/// children so callers read `results.get_child_content("status")` the
/// same way they read elements.
pub fn parse_document(xml: &str) -> Result<Node> {
    let mut reader = Reader::from_str(xml);
    let mut stack: Vec<Node> = Vec::new();
    let mut root: Option<Node> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) => {
                stack.push(node_from_start(&start)?);
            }
            Ok(Event::Empty(start)) => {
                let node = node_from_start(&start)?;
                attach(&mut stack, &mut root, node);
            }
            Ok(Event::Text(text)) => {
                let text = text
                    .unescape()
                    .map_err(|e| Error::Protocol(format!("xml text: {e}")))?;
                let text = text.trim();
                if !text.is_empty() {
                    if let Some(top) = stack.last_mut() {
                        top.set_content(text);
                    }
                }
            }
            Ok(Event::End(_)) => {
                let node = stack
                    .pop()
                    .ok_or_else(|| Error::Protocol("xml: unbalanced end tag".to_string()))?;
                attach(&mut stack, &mut root, node);
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(Error::Protocol(format!("xml: {e}"))),
        }
    }

    root.ok_or_else(|| Error::Protocol("xml: empty document".to_string()))
}

fn node_from_start(start: &quick_xml::events::BytesStart<'_>) -> Result<Node> {
    let name = String::from_utf8_lossy(start.name().as_ref()).to_string();
    let mut node = Node::new(name);
    for attr in start.attributes() {
        let attr = attr.map_err(|e| Error::Protocol(format!("xml attribute: {e}")))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
        let value = attr
            .unescape_value()
            .map_err(|e| Error::Protocol(format!("xml attribute: {e}")))?
            .to_string();
        node.new_child(key, value);
    }
    Ok(node)
}

fn attach(stack: &mut Vec<Node>, root: &mut Option<Node>, node: Node) {
    match stack.last_mut() {
        Some(parent) => parent.push_child(node),
        None => *root = Some(node),
    }
}

/// Walks a dotted path through nested elements.
pub fn node_path<'a>(node: &'a Node, path: &str) -> Option<&'a Node> {
    let mut current = node;
    for segment in path.split('.') {
        current = current.get_child(segment)?;
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESPONSE: &str = r#"<?xml version='1.0' encoding='UTF-8'?>
<netapp version='1.180' xmlns='http://www.netapp.com/filer/admin'>
  <results status="passed">
    <attributes-list>
      <volume-attributes>
        <volume-id-attributes>
          <name>vol0</name>
          <owning-vserver-name>svm1</owning-vserver-name>
        </volume-id-attributes>
        <volume-space-attributes>
          <size-used>1024</size-used>
        </volume-space-attributes>
      </volume-attributes>
    </attributes-list>
    <num-records>1</num-records>
  </results>
</netapp>"#;

    #[test]
    fn response_parses_into_tree() {
        let doc = parse_document(RESPONSE).unwrap();
        assert_eq!(doc.name(), "netapp");

        let results = doc.get_child("results").unwrap();
        assert_eq!(results.get_child_content("status"), Some("passed"));
        assert_eq!(results.get_child_content("num-records"), Some("1"));

        let volume = results
            .get_child("attributes-list")
            .and_then(|l| l.get_child("volume-attributes"))
            .unwrap();
        assert_eq!(
            node_path(volume, "volume-id-attributes.name").map(Node::content),
            Some("vol0")
        );
        assert_eq!(
            node_path(volume, "volume-space-attributes.size-used").map(Node::content),
            Some("1024")
        );
    }

    #[test]
    fn failed_status_carries_reason() {
        let xml = r#"<netapp><results status="failed" reason="entry not found" errno="15661"/></netapp>"#;
        let doc = parse_document(xml).unwrap();
        let results = doc.get_child("results").unwrap();
        assert_eq!(results.get_child_content("status"), Some("failed"));
        assert_eq!(results.get_child_content("errno"), Some("15661"));
    }

    #[test]
    fn requests_serialize_with_escaping() {
        let mut request = Node::new("volume-get-iter");
        request.new_child("max-records", "500");
        let mut query = Node::new("query");
        query.new_child("name", "a<b");
        request.push_child(query);

        let xml = node_to_xml(&request);
        assert_eq!(
            xml,
            "<volume-get-iter><max-records>500</max-records>\
             <query><name>a&lt;b</name></query></volume-get-iter>"
        );
    }

    #[test]
    fn xml_round_trips_through_the_tree() {
        let mut request = Node::new("perf-object-get-instances");
        request.new_child("objectname", "volume");
        let parsed = parse_document(&node_to_xml(&request)).unwrap();
        assert_eq!(parsed, request);
    }
}
