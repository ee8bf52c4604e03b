//! Accumulation of the `Params` and `Stdin` input streams of one request.
use super::{
    ProtocolError, RecordType,
    params::{Params, decode_pairs},
};

#[derive(Debug)]
pub struct Assembler {
    request_id: u16,
    raw_params: Vec<u8>,
    params: Option<Params>,
    stdin: Vec<u8>,
    stdin_closed: bool,
}

impl Assembler {
    pub fn new(request_id: u16) -> Self {
        Self {
            request_id,
            raw_params: Vec::new(),
            params: None,
            stdin: Vec::new(),
            stdin_closed: false,
        }
    }

    /// Feeds one `Params` record; empty content closes the stream.
    pub fn on_params(&mut self, content: &[u8]) -> Result<(), ProtocolError> {
        if content.is_empty() {
            self.on_params_end()
        } else {
            self.on_params_chunk(content)
        }
    }

    /// Feeds one `Stdin` record; empty content closes the stream.
    pub fn on_stdin(&mut self, content: &[u8]) -> Result<(), ProtocolError> {
        if content.is_empty() {
            self.on_stdin_end()
        } else {
            self.on_stdin_chunk(content)
        }
    }

    pub fn on_params_chunk(&mut self, chunk: &[u8]) -> Result<(), ProtocolError> {
        if self.params.is_some() {
            return Err(self.reopened(RecordType::Params));
        }
        self.raw_params.extend_from_slice(chunk);
        Ok(())
    }

    /// Decodes the accumulated parameter bytes in one pass.
    pub fn on_params_end(&mut self) -> Result<(), ProtocolError> {
        if self.params.is_some() {
            return Err(self.reopened(RecordType::Params));
        }
        let params = decode_pairs(&self.raw_params)?;
        self.raw_params = Vec::new();
        self.params = Some(params);
        Ok(())
    }

    pub fn on_stdin_chunk(&mut self, chunk: &[u8]) -> Result<(), ProtocolError> {
        if self.stdin_closed {
            return Err(self.reopened(RecordType::Stdin));
        }
        self.stdin.extend_from_slice(chunk);
        Ok(())
    }

    pub fn on_stdin_end(&mut self) -> Result<(), ProtocolError> {
        if self.stdin_closed {
            return Err(self.reopened(RecordType::Stdin));
        }
        self.stdin_closed = true;
        Ok(())
    }

    /// Both input streams have seen their end marker.
    pub fn is_ready(&self) -> bool {
        self.params.is_some() && self.stdin_closed
    }

    /// Hands out the decoded parameters and body once the request is ready.
    pub fn finish(self) -> Option<(Params, Vec<u8>)> {
        match (self.params, self.stdin_closed) {
            (Some(params), true) => Some((params, self.stdin)),
            _ => None,
        }
    }

    fn reopened(&self, stream: RecordType) -> ProtocolError {
        ProtocolError::StreamReopened {
            id: self.request_id,
            stream,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::protocol::params::encode_pairs;

    use super::*;

    fn environment() -> Vec<u8> {
        encode_pairs([
            ("REQUEST_METHOD", "POST"),
            ("QUERY_STRING", "x=1&y=2&r=3"),
            ("CONTENT_TYPE", "application/x-www-form-urlencoded"),
        ])
        .unwrap()
    }

    #[test]
    fn chunked_params_match_single_chunk() {
        let bytes = environment();
        let (a, rest) = bytes.split_at(5);
        let (b, c) = rest.split_at(17);

        let mut chunked = Assembler::new(1);
        for chunk in [a, b, c] {
            chunked.on_params(chunk).unwrap();
        }
        chunked.on_params(&[]).unwrap();
        chunked.on_stdin(&[]).unwrap();

        let mut single = Assembler::new(1);
        single.on_params(&bytes).unwrap();
        single.on_params(&[]).unwrap();
        single.on_stdin(&[]).unwrap();

        assert_eq!(chunked.finish().unwrap().0, single.finish().unwrap().0);
    }

    #[test]
    fn streams_close_in_either_order() {
        let mut stdin_first = Assembler::new(3);
        stdin_first.on_stdin(b"x=1").unwrap();
        stdin_first.on_stdin(&[]).unwrap();
        assert!(!stdin_first.is_ready());
        stdin_first.on_params(&environment()).unwrap();
        stdin_first.on_params(&[]).unwrap();
        assert!(stdin_first.is_ready());

        let mut interleaved = Assembler::new(3);
        interleaved.on_params(&environment()).unwrap();
        interleaved.on_stdin(b"x=1").unwrap();
        interleaved.on_params(&[]).unwrap();
        assert!(!interleaved.is_ready());
        interleaved.on_stdin(b"&y=2").unwrap();
        interleaved.on_stdin(&[]).unwrap();

        let (params, body) = interleaved.finish().unwrap();
        assert_eq!(params["REQUEST_METHOD"], "POST");
        assert_eq!(body, b"x=1&y=2");
    }

    #[test]
    fn unfinished_request_yields_nothing() {
        let mut assembler = Assembler::new(1);
        assembler.on_params(&[]).unwrap();
        assert!(assembler.finish().is_none());
    }

    #[test]
    fn params_after_end_is_rejected() {
        let mut assembler = Assembler::new(9);
        assembler.on_params(&[]).unwrap();

        let err = assembler.on_params(&environment()).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::StreamReopened {
                id: 9,
                stream: RecordType::Params
            }
        ));
    }

    #[test]
    fn second_stdin_end_is_rejected() {
        let mut assembler = Assembler::new(2);
        assembler.on_stdin(&[]).unwrap();

        let err = assembler.on_stdin(&[]).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::StreamReopened {
                id: 2,
                stream: RecordType::Stdin
            }
        ));
    }

    #[test]
    fn malformed_params_surface_on_end() {
        let mut assembler = Assembler::new(1);
        assembler.on_params(&[10, 10, b'a']).unwrap();
        assert!(matches!(
            assembler.on_params(&[]),
            Err(ProtocolError::TruncatedPair { .. })
        ));
    }
}
