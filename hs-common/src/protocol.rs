//! # Wire Codec
//!
//! Purpose: Map typed commands to request lines and response lines back to
//! typed responses, without touching a socket.
//!
//! ## Design Principles
//!
//! 1. **Pure Functions**: Encoding appends to a caller buffer; decoding reads a
//!    borrowed line. Neither side owns I/O.
//! 2. **Buffer Reuse**: Callers keep one output `Vec` per connection.
//! 3. **Fail Fast**: Any framing or count mismatch is a `ProtocolError`.
//! 4. **Bounded Framing**: `LineDecoder` refuses lines above a fixed size so a
//!    misbehaving peer cannot grow the buffer without limit.
//!
//! ## Line Grammar
//!
//! ```text
//! open_index:  P <id> <db> <table> <index> <c1,c2,...>
//! find:        <id> <op> <n> <v1> ... <vn> <limit> <offset>
//! insert:      <id> + <n> <v1> ... <vn>
//! modify:      <id> <op> <n> <v1> ... <vn> <limit> <offset> <U|D> [<m1> ... <mk>]
//! response:    <status> <f1> ... <fN>
//! ```
//!
//! Fields are separated by `\t`, lines end with `\n`. Bytes `0x00..=0x0F`
//! inside a field are sent as `0x01` followed by the byte plus `0x40`.

use bytes::BytesMut;

use crate::error::{ProtocolError, ProtocolResult};
use crate::types::{Command, ModifyOp, Response};

const TAB: u8 = b'\t';
const LF: u8 = b'\n';
const ESCAPE_PREFIX: u8 = 0x01;
const ESCAPE_SHIFT: u8 = 0x40;

/// Appends the wire form of `command`, terminator included, to `out`.
pub fn encode_command(command: &Command, out: &mut Vec<u8>) {
    match command {
        Command::OpenIndex {
            index_id,
            database,
            table,
            index_name,
            columns,
        } => {
            out.push(b'P');
            out.push(TAB);
            push_usize(out, *index_id as usize);
            out.push(TAB);
            push_escaped(out, database);
            out.push(TAB);
            push_escaped(out, table);
            out.push(TAB);
            push_escaped(out, index_name);
            out.push(TAB);
            for (idx, column) in columns.iter().enumerate() {
                if idx > 0 {
                    out.push(b',');
                }
                push_escaped(out, column);
            }
        }
        Command::Find {
            index_id,
            op,
            values,
            limit,
            offset,
        } => {
            push_key(out, *index_id, op.as_str(), values);
            out.push(TAB);
            push_usize(out, *limit as usize);
            out.push(TAB);
            push_usize(out, *offset as usize);
        }
        Command::Insert { index_id, values } => {
            push_key(out, *index_id, "+", values);
        }
        Command::Modify {
            index_id,
            op,
            values,
            limit,
            offset,
            modify_op,
            new_values,
        } => {
            push_key(out, *index_id, op.as_str(), values);
            out.push(TAB);
            push_usize(out, *limit as usize);
            out.push(TAB);
            push_usize(out, *offset as usize);
            out.push(TAB);
            out.extend_from_slice(modify_op.as_str().as_bytes());
            if *modify_op == ModifyOp::Update {
                for value in new_values {
                    out.push(TAB);
                    push_escaped(out, value);
                }
            }
        }
    }
    out.push(LF);
}

/// Decodes one response line. A trailing `\n` or `\r\n` is ignored.
pub fn decode_response(line: &[u8]) -> ProtocolResult<Response> {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    if line.is_empty() {
        return Err(ProtocolError::MissingStatus);
    }

    let mut parts = line.split(|&b| b == TAB);
    let status = match parts.next() {
        Some(raw) if !raw.is_empty() => unescape(raw)?,
        _ => return Err(ProtocolError::MissingStatus),
    };
    let fields = parts.map(unescape).collect::<ProtocolResult<Vec<_>>>()?;
    Ok(Response { status, fields })
}

/// Row data carried by a successful `Find` response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FindPayload<'a> {
    /// Per-row column count declared by the server.
    pub columns: usize,
    /// Flattened row values, `columns` per row.
    pub values: &'a [String],
}

impl<'a> FindPayload<'a> {
    /// Number of whole rows in the payload.
    pub fn row_count(&self) -> usize {
        if self.columns == 0 {
            0
        } else {
            self.values.len() / self.columns
        }
    }

    /// Iterates rows as slices of `columns` values.
    pub fn rows(&self) -> impl Iterator<Item = &'a [String]> {
        let width = self.columns.max(1);
        let values: &'a [String] = if self.columns == 0 { &[] } else { self.values };
        values.chunks_exact(width)
    }
}

/// Splits `fields` of a `Find` response into column count and row values.
///
/// A zero column count means no match and yields an empty payload.
pub fn decode_find_payload(fields: &[String]) -> ProtocolResult<FindPayload<'_>> {
    let (count, values) = fields
        .split_first()
        .ok_or(ProtocolError::MissingField("column count"))?;
    let columns = parse_count(count)?;
    if columns == 0 {
        return Ok(FindPayload {
            columns,
            values: &[],
        });
    }
    if values.len() % columns != 0 {
        return Err(ProtocolError::RaggedRows {
            columns,
            values: values.len(),
        });
    }
    Ok(FindPayload { columns, values })
}

/// Reads the affected-row count from a successful `Modify` response.
pub fn decode_modified_count(fields: &[String]) -> ProtocolResult<u64> {
    let raw = fields
        .get(1)
        .ok_or(ProtocolError::MissingField("modified count"))?;
    raw.parse()
        .map_err(|_| ProtocolError::InvalidNumber(raw.clone()))
}

/// Incremental splitter for `\n`-terminated lines.
///
/// Remembers how far it already scanned so repeated calls on a growing buffer
/// stay linear.
#[derive(Debug, Clone)]
pub struct LineDecoder {
    max_len: usize,
    scanned: usize,
}

impl LineDecoder {
    /// Creates a decoder that rejects lines longer than `max_len` bytes.
    pub fn new(max_len: usize) -> Self {
        LineDecoder {
            max_len,
            scanned: 0,
        }
    }

    /// Removes the next complete line from `buf`, without its terminator.
    ///
    /// Returns `Ok(None)` when more bytes are needed.
    pub fn next_line(&mut self, buf: &mut BytesMut) -> ProtocolResult<Option<BytesMut>> {
        let start = self.scanned.min(buf.len());
        if let Some(pos) = buf[start..].iter().position(|&b| b == LF) {
            let end = start + pos;
            self.scanned = 0;
            if end > self.max_len {
                return Err(ProtocolError::LineTooLong {
                    limit: self.max_len,
                });
            }
            let mut line = buf.split_to(end + 1);
            line.truncate(end);
            return Ok(Some(line));
        }

        self.scanned = buf.len();
        if buf.len() > self.max_len {
            return Err(ProtocolError::LineTooLong {
                limit: self.max_len,
            });
        }
        Ok(None)
    }
}

impl Default for LineDecoder {
    fn default() -> Self {
        LineDecoder::new(crate::types::MAX_LINE_LEN)
    }
}

fn push_key(out: &mut Vec<u8>, index_id: u32, op: &str, values: &[String]) {
    push_usize(out, index_id as usize);
    out.push(TAB);
    out.extend_from_slice(op.as_bytes());
    out.push(TAB);
    push_usize(out, values.len());
    for value in values {
        out.push(TAB);
        push_escaped(out, value);
    }
}

fn push_escaped(out: &mut Vec<u8>, value: &str) {
    for &b in value.as_bytes() {
        if b < 0x10 {
            out.push(ESCAPE_PREFIX);
            out.push(b + ESCAPE_SHIFT);
        } else {
            out.push(b);
        }
    }
}

fn unescape(raw: &[u8]) -> ProtocolResult<String> {
    let mut bytes = Vec::with_capacity(raw.len());
    let mut iter = raw.iter();
    while let Some(&b) = iter.next() {
        if b == ESCAPE_PREFIX {
            // A trailing prefix is reported as escaping 0x00.
            let shifted = iter.next().copied().unwrap_or(0);
            if !(ESCAPE_SHIFT..ESCAPE_SHIFT + 0x10).contains(&shifted) {
                return Err(ProtocolError::BadEscape(shifted));
            }
            bytes.push(shifted - ESCAPE_SHIFT);
        } else {
            bytes.push(b);
        }
    }
    String::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8)
}

fn parse_count(raw: &str) -> ProtocolResult<usize> {
    raw.parse()
        .map_err(|_| ProtocolError::InvalidNumber(raw.to_string()))
}

fn push_usize(out: &mut Vec<u8>, mut value: usize) {
    // Digits go through a stack buffer to keep encoding allocation-free.
    let mut buf = [0u8; 20];
    let mut len = 0;
    if value == 0 {
        buf[0] = b'0';
        len = 1;
    } else {
        while value > 0 {
            buf[len] = b'0' + (value % 10) as u8;
            value /= 10;
            len += 1;
        }
    }
    for idx in (0..len).rev() {
        out.push(buf[idx]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Operator;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn encode(command: &Command) -> String {
        let mut buf = Vec::new();
        encode_command(command, &mut buf);
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn encodes_open_index() {
        let command = Command::OpenIndex {
            index_id: 1,
            database: "d".into(),
            table: "t".into(),
            index_name: "PRIMARY".into(),
            columns: strings(&["k", "v"]),
        };
        assert_eq!(encode(&command), "P\t1\td\tt\tPRIMARY\tk,v\n");
    }

    #[test]
    fn encodes_find_with_limit_and_offset() {
        let command = Command::Find {
            index_id: 3,
            op: Operator::Ge,
            values: strings(&["blue1"]),
            limit: 10,
            offset: 2,
        };
        assert_eq!(encode(&command), "3\t>=\t1\tblue1\t10\t2\n");
    }

    #[test]
    fn encodes_insert() {
        let command = Command::Insert {
            index_id: 3,
            values: strings(&["blue1", "a quick brown fox"]),
        };
        assert_eq!(encode(&command), "3\t+\t2\tblue1\ta quick brown fox\n");
    }

    #[test]
    fn encodes_modify_update_with_new_values() {
        let command = Command::Modify {
            index_id: 3,
            op: Operator::Eq,
            values: strings(&["blue1"]),
            limit: 1,
            offset: 0,
            modify_op: ModifyOp::Update,
            new_values: strings(&["blue7", "some new thing"]),
        };
        assert_eq!(encode(&command), "3\t=\t1\tblue1\t1\t0\tU\tblue7\tsome new thing\n");
    }

    #[test]
    fn encodes_modify_delete_without_new_values() {
        let command = Command::Modify {
            index_id: 3,
            op: Operator::Eq,
            values: strings(&["blue2"]),
            limit: 1,
            offset: 0,
            modify_op: ModifyOp::Delete,
            new_values: strings(&["ignored"]),
        };
        assert_eq!(encode(&command), "3\t=\t1\tblue2\t1\t0\tD\n");
    }

    #[test]
    fn escapes_control_bytes() {
        let command = Command::Insert {
            index_id: 0,
            values: strings(&["a\tb\nc"]),
        };
        let mut buf = Vec::new();
        encode_command(&command, &mut buf);
        assert_eq!(buf, b"0\t+\t1\ta\x01\x49b\x01\x4ac\n".to_vec());

        let response = decode_response(b"0\t1\ta\x01\x49b\x01\x4ac\n").unwrap();
        assert_eq!(response.fields, strings(&["1", "a\tb\nc"]));
    }

    #[test]
    fn rejects_escape_outside_control_range() {
        assert_eq!(
            decode_response(b"0\t1\ta\x01\x20b\n"),
            Err(ProtocolError::BadEscape(0x20))
        );
        assert_eq!(
            decode_response(b"0\t1\ta\x01\x50\n"),
            Err(ProtocolError::BadEscape(0x50))
        );
        assert_eq!(
            decode_response(b"0\t1\ta\x01\n"),
            Err(ProtocolError::BadEscape(0x00))
        );
        assert_eq!(
            decode_response(b"0\t\x01\x40\x01\x4f\n").unwrap().fields,
            vec!["\u{0}\u{f}".to_string()]
        );
    }

    #[test]
    fn decodes_find_rows() {
        let response = decode_response(b"0\t2\tblue1\thello\tblue2\tworld\n").unwrap();
        assert!(response.is_ok());

        let payload = decode_find_payload(&response.fields).unwrap();
        assert_eq!(payload.columns, 2);
        assert_eq!(payload.row_count(), 2);
        let rows: Vec<_> = payload.rows().collect();
        assert_eq!(rows[0], &strings(&["blue1", "hello"])[..]);
        assert_eq!(rows[1], &strings(&["blue2", "world"])[..]);
    }

    #[test]
    fn rejects_ragged_find_payload() {
        let response = decode_response(b"0\t2\tblue1\thello\tblue2\n").unwrap();
        assert_eq!(
            decode_find_payload(&response.fields),
            Err(ProtocolError::RaggedRows {
                columns: 2,
                values: 3
            })
        );
    }

    #[test]
    fn zero_columns_is_empty_result() {
        let response = decode_response(b"0\t0\n").unwrap();
        let payload = decode_find_payload(&response.fields).unwrap();
        assert_eq!(payload.row_count(), 0);
        assert_eq!(payload.rows().count(), 0);
    }

    #[test]
    fn rejects_missing_status() {
        assert_eq!(decode_response(b"\n"), Err(ProtocolError::MissingStatus));
        assert_eq!(decode_response(b"\t1\n"), Err(ProtocolError::MissingStatus));
    }

    #[test]
    fn decodes_crlf_and_status_only_lines() {
        let response = decode_response(b"0\r\n").unwrap();
        assert_eq!(response.status, "0");
        assert!(response.fields.is_empty());
    }

    #[test]
    fn reads_modified_count() {
        let response = decode_response(b"0\t1\t3\n").unwrap();
        assert_eq!(decode_modified_count(&response.fields), Ok(3));

        let short = decode_response(b"0\t1\n").unwrap();
        assert_eq!(
            decode_modified_count(&short.fields),
            Err(ProtocolError::MissingField("modified count"))
        );
    }

    #[test]
    fn line_decoder_splits_across_reads() {
        let mut decoder = LineDecoder::new(64);
        let mut buf = BytesMut::from(&b"0\t1"[..]);
        assert_eq!(decoder.next_line(&mut buf), Ok(None));

        buf.extend_from_slice(b"\n2\t1\tstmtnum\n0");
        assert_eq!(decoder.next_line(&mut buf).unwrap().unwrap(), &b"0\t1"[..]);
        assert_eq!(
            decoder.next_line(&mut buf).unwrap().unwrap(),
            &b"2\t1\tstmtnum"[..]
        );
        assert_eq!(decoder.next_line(&mut buf), Ok(None));
        assert_eq!(&buf[..], b"0");
    }

    #[test]
    fn line_decoder_bounds_line_length() {
        let mut decoder = LineDecoder::new(4);
        let mut buf = BytesMut::from(&b"0\t1\t2\t3"[..]);
        assert_eq!(
            decoder.next_line(&mut buf),
            Err(ProtocolError::LineTooLong { limit: 4 })
        );
    }
}
