use serde_json::Value;

/// One item cut from the byte stream
#[derive(Debug)]
pub enum Decoded {
    Frame(Value),
    /// Not valid JSON; the decoder skipped to the next line
    Malformed(serde_json::Error),
}

/// Cuts a byte stream into whitespace-separated JSON values
///
/// Works for newline-delimited and for back-to-back frames. Bytes of an
/// incomplete value are kept until the rest arrives.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    pending: Vec<u8>,
}

impl FrameDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Decoded> {
        self.pending.extend_from_slice(chunk);

        let mut decoded = Vec::new();
        let mut consumed = 0;

        loop {
            let rest = &self.pending[consumed..];
            let Some(start) = rest.iter().position(|b| !b.is_ascii_whitespace()) else {
                consumed = self.pending.len();
                break;
            };
            let rest = &rest[start..];

            let mut values = serde_json::Deserializer::from_slice(rest).into_iter::<Value>();
            match values.next() {
                // A number running into the end of the buffer may continue
                Some(Ok(Value::Number(_))) if values.byte_offset() == rest.len() => {
                    consumed += start;
                    break;
                }
                Some(Ok(value)) => {
                    consumed += start + values.byte_offset();
                    decoded.push(Decoded::Frame(value));
                }
                Some(Err(e)) if e.is_eof() => {
                    consumed += start;
                    break;
                }
                Some(Err(e)) => {
                    consumed += start
                        + rest
                            .iter()
                            .position(|&b| b == b'\n')
                            .map_or(rest.len(), |pos| pos + 1);
                    decoded.push(Decoded::Malformed(e));
                }
                None => {
                    consumed = self.pending.len();
                    break;
                }
            }
        }

        self.pending.drain(..consumed);
        decoded
    }

    /// Drop any partial frame, e.g. after a reconnect
    pub fn reset(&mut self) {
        self.pending.clear();
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Number of records a frame carries
///
/// Containers count their elements, null and the empty string count nothing,
/// any other scalar is one record.
pub fn record_count(frame: &Value) -> usize {
    match frame {
        Value::Null => 0,
        Value::Array(items) => items.len(),
        Value::Object(fields) => fields.len(),
        Value::String(s) if s.is_empty() => 0,
        _ => 1,
    }
}

/// An empty frame is the explicit end-of-stream signal
pub fn is_end_of_stream(frame: &Value) -> bool {
    match frame {
        Value::Null => true,
        Value::Array(items) => items.is_empty(),
        Value::Object(fields) => fields.is_empty(),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}
