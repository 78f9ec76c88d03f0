//! HTTP request sniffing.
//!
//! A deliberately small parser over the to-server byte stream: request
//! line, `Host`, and `User-Agent`, plus the raw header block. Enough for
//! the `http_uri`/`uricontent`/`http_raw_header` predicates and the flat
//! HTTP log line; full protocol analysis belongs to an external parser.

/// Pending-bytes cap; requests with larger head sections are skipped.
const MAX_PENDING: usize = 64 * 1024;

/// One parsed request head.
#[derive(Debug, Clone, Default)]
pub struct HttpRequest {
    pub method: String,
    pub uri: String,
    pub host: Option<String>,
    pub user_agent: Option<String>,
    /// Raw header block: everything between the request line and the blank
    /// line, unnormalised.
    pub raw_headers: Vec<u8>,
}

/// Per-flow HTTP state over the to-server direction.
#[derive(Debug, Default)]
pub struct HttpState {
    pending: Vec<u8>,
    pub requests: Vec<HttpRequest>,
    /// How many requests the http log has already written.
    pub logged: usize,
}

impl HttpState {
    pub fn new() -> Self {
        HttpState::default()
    }

    /// Feeds reassembled to-server bytes; parses any complete request
    /// heads. Returns the number of new requests.
    pub fn feed(&mut self, data: &[u8]) -> usize {
        self.pending.extend_from_slice(data);
        let mut parsed = 0;
        loop {
            let Some(head_len) = find_head_end(&self.pending) else {
                if self.pending.len() > MAX_PENDING {
                    self.pending.clear();
                }
                break;
            };
            match self.parse_head(head_len) {
                Some(req) => {
                    self.requests.push(req);
                    parsed += 1;
                }
                None => {
                    // Not HTTP; stop trying on this flow's buffered bytes.
                    self.pending.clear();
                    break;
                }
            }
            self.pending.drain(..head_len);
        }
        parsed
    }

    fn parse_head(&self, head_len: usize) -> Option<HttpRequest> {
        let head = &self.pending[..head_len];
        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(head) {
            Ok(httparse::Status::Complete(_)) => {}
            _ => return None,
        }
        let method = req.method?.to_string();
        let uri = req.path?.to_string();
        let mut host = None;
        let mut user_agent = None;
        for h in req.headers.iter() {
            if h.name.eq_ignore_ascii_case("host") {
                host = String::from_utf8(h.value.to_vec()).ok();
            } else if h.name.eq_ignore_ascii_case("user-agent") {
                user_agent = String::from_utf8(h.value.to_vec()).ok();
            }
        }
        // Raw headers start after the request line's CRLF.
        let line_end = head
            .windows(2)
            .position(|w| w == b"\r\n")
            .map(|p| p + 2)
            .unwrap_or(0);
        Some(HttpRequest {
            method,
            uri,
            host,
            user_agent,
            raw_headers: head[line_end..].to_vec(),
        })
    }

    /// The most recently parsed request, the one predicates evaluate.
    pub fn last_request(&self) -> Option<&HttpRequest> {
        self.requests.last()
    }
}

/// Offset just past the `\r\n\r\n` terminating a request head.
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}
