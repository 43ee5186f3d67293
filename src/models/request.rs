use crate::error::{ProxyError, Result};

const MAX_HEADERS: usize = 100;

/// Request head read from a freshly accepted client connection
///
/// Immutable once parsed; the listener hands it to exactly one handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRequest {
    /// Request method, case preserved
    pub method: String,
    /// Raw request-target (absolute URL, origin path, or `CONNECT` authority)
    pub target: String,
    /// Minor HTTP version (`1` for HTTP/1.1)
    pub version: u8,
    /// Header fields in arrival order, duplicates preserved
    pub headers: Vec<(String, String)>,
}

impl ClientRequest {
    /// Parse a request head from the start of `buf`
    ///
    /// Returns `Ok(None)` while the head is still incomplete, otherwise the
    /// request and the number of bytes the head occupies.
    pub fn parse(buf: &[u8]) -> Result<Option<(ClientRequest, usize)>> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);

        let head_len = match req.parse(buf) {
            Ok(httparse::Status::Complete(len)) => len,
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(e) => return Err(ProxyError::MalformedRequest(e.to_string())),
        };

        let (Some(method), Some(target), Some(version)) = (req.method, req.path, req.version)
        else {
            return Err(ProxyError::MalformedRequest("incomplete request line".into()));
        };

        let headers = req
            .headers
            .iter()
            .map(|h| {
                (
                    h.name.to_string(),
                    String::from_utf8_lossy(h.value).into_owned(),
                )
            })
            .collect();

        Ok(Some((
            ClientRequest {
                method: method.to_string(),
                target: target.to_string(),
                version,
                headers,
            },
            head_len,
        )))
    }

    /// Whether this request opens a tunnel
    pub fn is_connect(&self) -> bool {
        self.method == "CONNECT"
    }
}
