//! Client commands decoded from RESP frames.

use super::parser::Frame;
use bytes::Bytes;

/// A client command: the name followed by its arguments, all raw bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    args: Vec<Bytes>,
}

impl Command {
    /// Build a command from a request frame, which must be a non-empty
    /// array of bulk strings.
    pub fn from_frame(frame: Frame) -> Result<Command, String> {
        let frames = match frame {
            Frame::Array(Some(frames)) if !frames.is_empty() => frames,
            Frame::Array(_) => return Err("ERR Protocol error: empty command".to_string()),
            _ => return Err("ERR Protocol error: expected array of bulk strings".to_string()),
        };

        let args = frames
            .into_iter()
            .map(|frame| match frame {
                Frame::Bulk(Some(data)) => Ok(data),
                _ => Err("ERR Protocol error: expected array of bulk strings".to_string()),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Command { args })
    }

    /// Lowercased command name, used for routing
    pub fn name(&self) -> String {
        String::from_utf8_lossy(&self.args[0]).to_lowercase()
    }

    /// Command name exactly as the client sent it, for error messages
    pub fn raw_name(&self) -> String {
        String::from_utf8_lossy(&self.args[0]).into_owned()
    }

    /// Number of words including the command name
    pub fn argc(&self) -> usize {
        self.args.len()
    }

    /// Word `index`, with the command name at 0
    pub fn arg(&self, index: usize) -> Option<&Bytes> {
        self.args.get(index)
    }

    /// Words from `index` on
    pub fn args_from(&self, index: usize) -> &[Bytes] {
        self.args.get(index..).unwrap_or(&[])
    }
}

impl<S: AsRef<[u8]>> FromIterator<S> for Command {
    /// Build a command from words; an empty iterator yields an empty name
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut args: Vec<Bytes> = iter
            .into_iter()
            .map(|s| Bytes::copy_from_slice(s.as_ref()))
            .collect();
        if args.is_empty() {
            args.push(Bytes::new());
        }
        Command { args }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_frame() {
        let frame = Frame::array(vec![
            Frame::bulk(Bytes::from_static(b"SeT")),
            Frame::bulk(Bytes::from_static(b"k")),
            Frame::bulk(Bytes::from_static(b"v")),
        ]);
        let cmd = Command::from_frame(frame).unwrap();
        assert_eq!(cmd.name(), "set");
        assert_eq!(cmd.raw_name(), "SeT");
        assert_eq!(cmd.argc(), 3);
        assert_eq!(cmd.arg(1).map(|b| &b[..]), Some(&b"k"[..]));
        assert_eq!(cmd.args_from(3).len(), 0);
        assert_eq!(cmd.args_from(9).len(), 0);
    }

    #[test]
    fn test_rejects_non_bulk_frames() {
        assert!(Command::from_frame(Frame::simple("PING")).is_err());
        assert!(Command::from_frame(Frame::Array(None)).is_err());
        assert!(Command::from_frame(Frame::array(vec![])).is_err());
        assert!(Command::from_frame(Frame::array(vec![Frame::integer(1)])).is_err());
    }

    #[test]
    fn test_collect_words() {
        let cmd: Command = ["GET", "k"].into_iter().collect();
        assert_eq!(cmd.name(), "get");
        assert_eq!(cmd.argc(), 2);
    }
}
