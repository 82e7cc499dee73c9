//! Request/response framing over an interactive shell's stdin/stdout.
//!
//! The shell stream has no message boundaries. After each command we ask the
//! shell to `echo` a marker; the shell prints it only after the command's own
//! output, so everything read before the marker line is the reply.

use std::io::{BufRead, Write};

use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramedReply {
    pub text: String,
    /// False when the stream hit EOF before the marker showed up.
    pub complete: bool,
}

/// A fresh marker per call so command output can never collide with it.
pub fn new_sentinel() -> String {
    format!("__LBT_END_{}__", Uuid::new_v4().simple())
}

pub fn frame_command<R, W>(
    reader: &mut R,
    writer: &mut W,
    command: &str,
    sentinel: &str,
) -> std::io::Result<FramedReply>
where
    R: BufRead + ?Sized,
    W: Write + ?Sized,
{
    writer.write_all(command.as_bytes())?;
    writer.write_all(b"\n")?;
    writer.write_all(format!("echo {sentinel}\n").as_bytes())?;
    writer.flush()?;

    read_until_sentinel(reader, sentinel)
}

pub fn read_until_sentinel<R>(reader: &mut R, sentinel: &str) -> std::io::Result<FramedReply>
where
    R: BufRead + ?Sized,
{
    let mut collected = String::new();
    let mut raw = Vec::<u8>::new();
    loop {
        raw.clear();
        let read = reader.read_until(b'\n', &mut raw)?;
        if read == 0 {
            return Ok(FramedReply {
                text: collected.trim().to_string(),
                complete: false,
            });
        }
        let line = String::from_utf8_lossy(&raw);
        if let Some(at) = line.find(sentinel) {
            // Output without a trailing newline shares the marker's line.
            collected.push_str(&line[..at]);
            return Ok(FramedReply {
                text: collected.trim().to_string(),
                complete: true,
            });
        }
        collected.push_str(&line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn writes_command_then_marker_echo() {
        let mut reader = Cursor::new(b"hello\n__M__\n".to_vec());
        let mut written = Vec::<u8>::new();
        let reply = frame_command(&mut reader, &mut written, "echo hello", "__M__").expect("frame");
        assert_eq!(String::from_utf8(written).unwrap(), "echo hello\necho __M__\n");
        assert_eq!(
            reply,
            FramedReply {
                text: "hello".to_string(),
                complete: true
            }
        );
    }

    #[test]
    fn stops_at_marker_and_leaves_the_rest_unread() {
        let mut reader = Cursor::new(b"  a\nb  \n__M__\nnext reply\n".to_vec());
        let reply = read_until_sentinel(&mut reader, "__M__").expect("read");
        assert_eq!(reply.text, "a\nb");
        assert!(reply.complete);

        let mut rest = String::new();
        reader.read_line(&mut rest).expect("rest");
        assert_eq!(rest, "next reply\n");
    }

    #[test]
    fn empty_command_round_trips_as_empty_text() {
        let mut reader = Cursor::new(b"__M__\n".to_vec());
        let mut written = Vec::<u8>::new();
        let reply = frame_command(&mut reader, &mut written, "", "__M__").expect("frame");
        assert_eq!(reply.text, "");
        assert!(reply.complete);
    }

    #[test]
    fn text_sharing_the_marker_line_is_kept() {
        let mut reader = Cursor::new(b"first\nabc__M__\nnext\n".to_vec());
        let reply = read_until_sentinel(&mut reader, "__M__").expect("read");
        assert_eq!(reply.text, "first\nabc");
        assert!(reply.complete);
    }

    #[test]
    fn eof_before_marker_returns_partial_text() {
        let mut reader = Cursor::new(b"partial output\nmore".to_vec());
        let reply = read_until_sentinel(&mut reader, "__M__").expect("read");
        assert_eq!(reply.text, "partial output\nmore");
        assert!(!reply.complete);
    }

    #[test]
    fn invalid_utf8_is_replaced_not_fatal() {
        let mut reader = Cursor::new(b"ok \xff\n__M__\n".to_vec());
        let reply = read_until_sentinel(&mut reader, "__M__").expect("read");
        assert!(reply.text.starts_with("ok"));
        assert!(reply.complete);
    }

    #[test]
    fn sentinels_are_unique_per_call() {
        let first = new_sentinel();
        let second = new_sentinel();
        assert_ne!(first, second);
        assert!(!first.contains(' '));
    }
}
