//! The `ra_svn` wire form of [`EditorCommand`]s.
//!
//! Each command is one line: `( name ( params... ) )`. Optional values are
//! encoded as tuples that are empty when the value is absent; text deltas
//! travel as svndiff bytes in `textdelta-chunk` strings.

use crate::path::{validate_rel_dir_path_ref, validate_rel_path, validate_rel_path_ref};
use crate::{CopyFrom, Revnum, SvnError};

use super::EditorCommand;
use super::item::{SvnItem, parse_item};

pub(crate) struct WireEncoder<'a> {
    out: &'a mut Vec<u8>,
}

impl<'a> WireEncoder<'a> {
    pub(crate) fn new(out: &'a mut Vec<u8>) -> Self {
        Self { out }
    }

    pub(crate) fn word(&mut self, word: &str) {
        self.out.extend_from_slice(word.as_bytes());
        self.out.push(b' ');
    }

    pub(crate) fn number(&mut self, n: u64) {
        encode_decimal_u64(n, self.out);
        self.out.push(b' ');
    }

    pub(crate) fn bool(&mut self, b: bool) {
        if b {
            self.out.extend_from_slice(b"true ");
        } else {
            self.out.extend_from_slice(b"false ");
        }
    }

    pub(crate) fn string_bytes(&mut self, bytes: &[u8]) {
        encode_decimal_u64(bytes.len() as u64, self.out);
        self.out.push(b':');
        self.out.extend_from_slice(bytes);
        self.out.push(b' ');
    }

    pub(crate) fn string_str(&mut self, s: &str) {
        self.string_bytes(s.as_bytes());
    }

    pub(crate) fn list_start(&mut self) {
        self.out.extend_from_slice(b"( ");
    }

    pub(crate) fn list_end(&mut self) {
        self.out.extend_from_slice(b") ");
    }

    pub(crate) fn newline(&mut self) {
        self.out.push(b'\n');
    }

    fn opt_rev(&mut self, rev: Option<Revnum>) -> Result<(), SvnError> {
        self.list_start();
        if let Some(rev) = rev {
            let rev = u64::try_from(rev)
                .map_err(|_| SvnError::Protocol(format!("invalid revision {rev}")))?;
            self.number(rev);
        }
        self.list_end();
        Ok(())
    }

    fn opt_string(&mut self, value: Option<&str>) {
        self.list_start();
        if let Some(value) = value {
            self.string_str(value);
        }
        self.list_end();
    }

    fn opt_bytes(&mut self, value: Option<&[u8]>) {
        self.list_start();
        if let Some(value) = value {
            self.string_bytes(value);
        }
        self.list_end();
    }

    fn copy_from(&mut self, copy_from: Option<&CopyFrom>) -> Result<(), SvnError> {
        self.list_start();
        if let Some(copy_from) = copy_from {
            let copy_path = validate_rel_dir_path_ref(&copy_from.path)?;
            let rev = u64::try_from(copy_from.rev).map_err(|_| {
                SvnError::Protocol(format!("invalid copy-from revision {}", copy_from.rev))
            })?;
            self.string_str(copy_path.as_ref());
            self.number(rev);
        }
        self.list_end();
        Ok(())
    }
}

pub(crate) fn encode_decimal_u64(mut n: u64, out: &mut Vec<u8>) {
    if n == 0 {
        out.push(b'0');
        return;
    }
    let mut buf = [0u8; 20];
    let mut i = buf.len();
    while n > 0 {
        let digit = (n % 10) as u8;
        n /= 10;
        i -= 1;
        buf[i] = b'0' + digit;
    }
    out.extend_from_slice(&buf[i..]);
}

/// Appends the wire line for `cmd` to `out`.
///
/// Paths are validated on the way out; an unsafe path is an error rather
/// than something to put on the wire.
pub fn encode_command(cmd: &EditorCommand, out: &mut Vec<u8>) -> Result<(), SvnError> {
    let mut enc = WireEncoder::new(out);
    enc.list_start();
    match cmd {
        EditorCommand::TargetRev { rev } => {
            enc.word("target-rev");
            enc.list_start();
            let rev = u64::try_from(*rev)
                .map_err(|_| SvnError::Protocol(format!("invalid target revision {rev}")))?;
            enc.number(rev);
            enc.list_end();
        }
        EditorCommand::OpenRoot { rev, token } => {
            enc.word("open-root");
            enc.list_start();
            enc.opt_rev(*rev)?;
            enc.string_str(token);
            enc.list_end();
        }
        EditorCommand::DeleteEntry {
            path,
            rev,
            dir_token,
        } => {
            let path = validate_rel_path_ref(path)?;
            enc.word("delete-entry");
            enc.list_start();
            enc.string_str(path.as_ref());
            enc.opt_rev(*rev)?;
            enc.string_str(dir_token);
            enc.list_end();
        }
        EditorCommand::AddDir {
            path,
            parent_token,
            child_token,
            copy_from,
        } => {
            let path = validate_rel_path_ref(path)?;
            enc.word("add-dir");
            enc.list_start();
            enc.string_str(path.as_ref());
            enc.string_str(parent_token);
            enc.string_str(child_token);
            enc.copy_from(copy_from.as_ref())?;
            enc.list_end();
        }
        EditorCommand::OpenDir {
            path,
            parent_token,
            child_token,
            rev,
        } => {
            let path = validate_rel_path_ref(path)?;
            enc.word("open-dir");
            enc.list_start();
            enc.string_str(path.as_ref());
            enc.string_str(parent_token);
            enc.string_str(child_token);
            enc.opt_rev(*rev)?;
            enc.list_end();
        }
        EditorCommand::ChangeDirProp {
            dir_token,
            name,
            value,
        } => {
            enc.word("change-dir-prop");
            enc.list_start();
            enc.string_str(dir_token);
            enc.string_str(name);
            enc.opt_bytes(value.as_deref());
            enc.list_end();
        }
        EditorCommand::CloseDir { dir_token } => {
            enc.word("close-dir");
            enc.list_start();
            enc.string_str(dir_token);
            enc.list_end();
        }
        EditorCommand::AbsentDir { path, parent_token } => {
            let path = validate_rel_path_ref(path)?;
            enc.word("absent-dir");
            enc.list_start();
            enc.string_str(path.as_ref());
            enc.string_str(parent_token);
            enc.list_end();
        }
        EditorCommand::AddFile {
            path,
            dir_token,
            file_token,
            copy_from,
        } => {
            let path = validate_rel_path_ref(path)?;
            enc.word("add-file");
            enc.list_start();
            enc.string_str(path.as_ref());
            enc.string_str(dir_token);
            enc.string_str(file_token);
            enc.copy_from(copy_from.as_ref())?;
            enc.list_end();
        }
        EditorCommand::OpenFile {
            path,
            dir_token,
            file_token,
            rev,
        } => {
            let path = validate_rel_path_ref(path)?;
            enc.word("open-file");
            enc.list_start();
            enc.string_str(path.as_ref());
            enc.string_str(dir_token);
            enc.string_str(file_token);
            enc.opt_rev(*rev)?;
            enc.list_end();
        }
        EditorCommand::ApplyTextDelta {
            file_token,
            base_checksum,
        } => {
            enc.word("apply-textdelta");
            enc.list_start();
            enc.string_str(file_token);
            enc.opt_string(base_checksum.as_deref());
            enc.list_end();
        }
        EditorCommand::TextDeltaChunk { file_token, chunk } => {
            enc.word("textdelta-chunk");
            enc.list_start();
            enc.string_str(file_token);
            enc.string_bytes(chunk);
            enc.list_end();
        }
        EditorCommand::TextDeltaEnd { file_token } => {
            enc.word("textdelta-end");
            enc.list_start();
            enc.string_str(file_token);
            enc.list_end();
        }
        EditorCommand::ChangeFileProp {
            file_token,
            name,
            value,
        } => {
            enc.word("change-file-prop");
            enc.list_start();
            enc.string_str(file_token);
            enc.string_str(name);
            enc.opt_bytes(value.as_deref());
            enc.list_end();
        }
        EditorCommand::CloseFile {
            file_token,
            text_checksum,
        } => {
            enc.word("close-file");
            enc.list_start();
            enc.string_str(file_token);
            enc.opt_string(text_checksum.as_deref());
            enc.list_end();
        }
        EditorCommand::AbsentFile { path, parent_token } => {
            let path = validate_rel_path_ref(path)?;
            enc.word("absent-file");
            enc.list_start();
            enc.string_str(path.as_ref());
            enc.string_str(parent_token);
            enc.list_end();
        }
        EditorCommand::CloseEdit => {
            enc.word("close-edit");
            enc.list_start();
            enc.list_end();
        }
        EditorCommand::AbortEdit => {
            enc.word("abort-edit");
            enc.list_start();
            enc.list_end();
        }
    }
    enc.list_end();
    enc.newline();
    Ok(())
}

/// Encodes a whole command sequence.
pub fn encode_commands<'c>(
    commands: impl IntoIterator<Item = &'c EditorCommand>,
) -> Result<Vec<u8>, SvnError> {
    let mut out = Vec::new();
    for cmd in commands {
        encode_command(cmd, &mut out)?;
    }
    Ok(out)
}

/// Converts one parsed `( name ( params... ) )` item into a command.
pub fn parse_command(item: &SvnItem) -> Result<EditorCommand, SvnError> {
    let parts = item
        .as_list()
        .ok_or_else(|| SvnError::Protocol("editor command is not a list".into()))?;
    let (Some(name), Some(params)) = (
        parts.first().and_then(SvnItem::as_word),
        parts.get(1).and_then(SvnItem::as_list),
    ) else {
        return Err(SvnError::Protocol("malformed editor command".into()));
    };
    parse_editor_command(name, params)
}

fn parse_editor_command(cmd: &str, params: &[SvnItem]) -> Result<EditorCommand, SvnError> {
    match cmd {
        "target-rev" => {
            let rev = params
                .first()
                .and_then(opt_tuple_rev)
                .ok_or_else(|| SvnError::Protocol("target-rev missing rev".into()))?;
            Ok(EditorCommand::TargetRev { rev })
        }
        "open-root" => {
            if params.len() < 2 {
                return Err(SvnError::Protocol("open-root params too short".into()));
            }
            Ok(EditorCommand::OpenRoot {
                rev: opt_tuple_rev(&params[0]),
                token: req_string(&params[1], "open-root token")?,
            })
        }
        "delete-entry" => {
            if params.len() < 3 {
                return Err(SvnError::Protocol("delete-entry params too short".into()));
            }
            Ok(EditorCommand::DeleteEntry {
                path: req_rel_path(&params[0], "delete-entry path")?,
                rev: opt_tuple_rev(&params[1]),
                dir_token: req_string(&params[2], "delete-entry dir token")?,
            })
        }
        "add-dir" => {
            if params.len() < 3 {
                return Err(SvnError::Protocol("add-dir params too short".into()));
            }
            Ok(EditorCommand::AddDir {
                path: req_rel_path(&params[0], "add-dir path")?,
                parent_token: req_string(&params[1], "add-dir parent token")?,
                child_token: req_string(&params[2], "add-dir child token")?,
                copy_from: match params.get(3) {
                    Some(item) => opt_tuple_copyfrom(item)?,
                    None => None,
                },
            })
        }
        "open-dir" => {
            if params.len() < 3 {
                return Err(SvnError::Protocol("open-dir params too short".into()));
            }
            Ok(EditorCommand::OpenDir {
                path: req_rel_path(&params[0], "open-dir path")?,
                parent_token: req_string(&params[1], "open-dir parent token")?,
                child_token: req_string(&params[2], "open-dir child token")?,
                rev: params.get(3).and_then(opt_tuple_rev),
            })
        }
        "change-dir-prop" => {
            if params.len() < 2 {
                return Err(SvnError::Protocol(
                    "change-dir-prop params too short".into(),
                ));
            }
            Ok(EditorCommand::ChangeDirProp {
                dir_token: req_string(&params[0], "change-dir-prop token")?,
                name: req_string(&params[1], "change-dir-prop name")?,
                value: params.get(2).and_then(opt_tuple_bytes),
            })
        }
        "close-dir" => Ok(EditorCommand::CloseDir {
            dir_token: first_string(params, "close-dir token")?,
        }),
        "absent-dir" => {
            if params.len() < 2 {
                return Err(SvnError::Protocol("absent-dir params too short".into()));
            }
            Ok(EditorCommand::AbsentDir {
                path: req_rel_path(&params[0], "absent-dir path")?,
                parent_token: req_string(&params[1], "absent-dir parent token")?,
            })
        }
        "add-file" => {
            if params.len() < 3 {
                return Err(SvnError::Protocol("add-file params too short".into()));
            }
            Ok(EditorCommand::AddFile {
                path: req_rel_path(&params[0], "add-file path")?,
                dir_token: req_string(&params[1], "add-file dir token")?,
                file_token: req_string(&params[2], "add-file file token")?,
                copy_from: match params.get(3) {
                    Some(item) => opt_tuple_copyfrom(item)?,
                    None => None,
                },
            })
        }
        "open-file" => {
            if params.len() < 3 {
                return Err(SvnError::Protocol("open-file params too short".into()));
            }
            Ok(EditorCommand::OpenFile {
                path: req_rel_path(&params[0], "open-file path")?,
                dir_token: req_string(&params[1], "open-file dir token")?,
                file_token: req_string(&params[2], "open-file file token")?,
                rev: params.get(3).and_then(opt_tuple_rev),
            })
        }
        "apply-textdelta" => Ok(EditorCommand::ApplyTextDelta {
            file_token: first_string(params, "apply-textdelta token")?,
            base_checksum: params.get(1).and_then(opt_tuple_string),
        }),
        "textdelta-chunk" => {
            if params.len() < 2 {
                return Err(SvnError::Protocol(
                    "textdelta-chunk params too short".into(),
                ));
            }
            Ok(EditorCommand::TextDeltaChunk {
                file_token: req_string(&params[0], "textdelta-chunk token")?,
                chunk: req_bytes(&params[1], "textdelta-chunk chunk")?,
            })
        }
        "textdelta-end" => Ok(EditorCommand::TextDeltaEnd {
            file_token: first_string(params, "textdelta-end token")?,
        }),
        "change-file-prop" => {
            if params.len() < 2 {
                return Err(SvnError::Protocol(
                    "change-file-prop params too short".into(),
                ));
            }
            Ok(EditorCommand::ChangeFileProp {
                file_token: req_string(&params[0], "change-file-prop token")?,
                name: req_string(&params[1], "change-file-prop name")?,
                value: params.get(2).and_then(opt_tuple_bytes),
            })
        }
        "close-file" => Ok(EditorCommand::CloseFile {
            file_token: first_string(params, "close-file token")?,
            text_checksum: params.get(1).and_then(opt_tuple_string),
        }),
        "absent-file" => {
            if params.len() < 2 {
                return Err(SvnError::Protocol("absent-file params too short".into()));
            }
            Ok(EditorCommand::AbsentFile {
                path: req_rel_path(&params[0], "absent-file path")?,
                parent_token: req_string(&params[1], "absent-file parent token")?,
            })
        }
        "close-edit" => Ok(EditorCommand::CloseEdit),
        "abort-edit" => Ok(EditorCommand::AbortEdit),
        _ => Err(SvnError::Protocol(format!("unknown editor command: {cmd}"))),
    }
}

fn first_string(params: &[SvnItem], ctx: &str) -> Result<String, SvnError> {
    params
        .first()
        .and_then(SvnItem::as_str)
        .map(str::to_string)
        .ok_or_else(|| SvnError::Protocol(format!("{ctx} missing")))
}

fn req_string(item: &SvnItem, ctx: &str) -> Result<String, SvnError> {
    item.as_str()
        .map(str::to_string)
        .ok_or_else(|| SvnError::Protocol(format!("{ctx} not a string")))
}

fn req_rel_path(item: &SvnItem, ctx: &str) -> Result<String, SvnError> {
    let raw = req_string(item, ctx)?;
    validate_rel_path(&raw)
}

fn req_bytes(item: &SvnItem, ctx: &str) -> Result<Vec<u8>, SvnError> {
    item.as_bytes()
        .map(<[u8]>::to_vec)
        .ok_or_else(|| SvnError::Protocol(format!("{ctx} not a string")))
}

fn opt_tuple_rev(item: &SvnItem) -> Option<Revnum> {
    let n = match item {
        SvnItem::List(items) => items.first().and_then(SvnItem::as_u64),
        _ => item.as_u64(),
    }?;
    Revnum::try_from(n).ok()
}

fn opt_tuple_string(item: &SvnItem) -> Option<String> {
    match item {
        SvnItem::List(items) => items.first().and_then(SvnItem::as_str).map(str::to_string),
        _ => item.as_str().map(str::to_string),
    }
}

fn opt_tuple_bytes(item: &SvnItem) -> Option<Vec<u8>> {
    match item {
        SvnItem::List(items) => items.first().and_then(SvnItem::as_bytes).map(<[u8]>::to_vec),
        _ => item.as_bytes().map(<[u8]>::to_vec),
    }
}

fn opt_tuple_copyfrom(item: &SvnItem) -> Result<Option<CopyFrom>, SvnError> {
    let Some(items) = item.as_list() else {
        return Ok(None);
    };
    if items.is_empty() {
        return Ok(None);
    }
    if items.len() < 2 {
        return Err(SvnError::Protocol("copy-from tuple too short".into()));
    }
    let path = items[0]
        .as_str()
        .ok_or_else(|| SvnError::Protocol("copy-from path not a string".into()))?;
    let rev = items[1]
        .as_u64()
        .and_then(|rev| Revnum::try_from(rev).ok())
        .ok_or_else(|| SvnError::Protocol("copy-from rev not a number".into()))?;
    CopyFrom::from_parts(Some(path), Some(rev))
}

/// Splits an incoming byte stream into [`EditorCommand`]s.
///
/// Bytes may arrive in arbitrary pieces; commands are returned once complete.
#[derive(Debug, Default)]
pub struct CommandDecoder {
    buf: Vec<u8>,
}

impl CommandDecoder {
    /// Creates an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends received bytes.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Returns the next complete command, if one is buffered.
    pub fn next_command(&mut self) -> Result<Option<EditorCommand>, SvnError> {
        let Some((item, used)) = parse_item(&self.buf)? else {
            return Ok(None);
        };
        self.buf.drain(..used);
        parse_command(&item).map(Some)
    }

    /// Checks that nothing but whitespace is left over.
    pub fn finish(&self) -> Result<(), SvnError> {
        if self.buf.iter().all(u8::is_ascii_whitespace) {
            Ok(())
        } else {
            Err(SvnError::Protocol(format!(
                "{} trailing bytes after the last editor command",
                self.buf.len()
            )))
        }
    }
}

/// Decodes every command in `bytes`.
pub fn decode_commands(bytes: &[u8]) -> Result<Vec<EditorCommand>, SvnError> {
    let mut decoder = CommandDecoder::new();
    decoder.push(bytes);
    let mut commands = Vec::new();
    while let Some(cmd) = decoder.next_command()? {
        commands.push(cmd);
    }
    decoder.finish()?;
    Ok(commands)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn encode_line(cmd: &EditorCommand) -> Vec<u8> {
        let mut out = Vec::new();
        encode_command(cmd, &mut out).unwrap();
        out
    }

    #[test]
    fn revisions_are_encoded_as_optional_tuples() {
        assert_eq!(
            encode_line(&EditorCommand::OpenRoot {
                rev: None,
                token: "d0.0".into(),
            }),
            b"( open-root ( ( ) 4:d0.0 ) ) \n"
        );
        assert_eq!(
            encode_line(&EditorCommand::OpenFile {
                path: "trunk/a".into(),
                dir_token: "d1.0".into(),
                file_token: "f2.0".into(),
                rev: Some(7),
            }),
            b"( open-file ( 7:trunk/a 4:d1.0 4:f2.0 ( 7 ) ) ) \n"
        );
    }

    #[test]
    fn copy_from_and_prop_values_use_tuples() {
        assert_eq!(
            encode_line(&EditorCommand::AddDir {
                path: "branches/b1".into(),
                parent_token: "d1.0".into(),
                child_token: "d2.0".into(),
                copy_from: Some(CopyFrom::new("trunk", 3)),
            }),
            b"( add-dir ( 11:branches/b1 4:d1.0 4:d2.0 ( 5:trunk 3 ) ) ) \n"
        );
        assert_eq!(
            encode_line(&EditorCommand::ChangeDirProp {
                dir_token: "d0.0".into(),
                name: "svn:ignore".into(),
                value: None,
            }),
            b"( change-dir-prop ( 4:d0.0 10:svn:ignore ( ) ) ) \n"
        );
    }

    #[test]
    fn encode_rejects_unsafe_paths() {
        let mut out = Vec::new();
        let err = encode_command(
            &EditorCommand::DeleteEntry {
                path: "../etc".into(),
                rev: None,
                dir_token: "d0.0".into(),
            },
            &mut out,
        )
        .unwrap_err();
        assert!(matches!(err, SvnError::InvalidPath(_)));

        let err = encode_command(
            &EditorCommand::AddFile {
                path: "/abs".into(),
                dir_token: "d0.0".into(),
                file_token: "f1.0".into(),
                copy_from: None,
            },
            &mut out,
        )
        .unwrap_err();
        assert!(matches!(err, SvnError::InvalidPath(_)));
    }

    #[test]
    fn decoder_handles_split_input() {
        let commands = vec![
            EditorCommand::TargetRev { rev: 4 },
            EditorCommand::OpenRoot {
                rev: Some(3),
                token: "d0.0".into(),
            },
            EditorCommand::AddFile {
                path: "bin".into(),
                dir_token: "d0.0".into(),
                file_token: "f1.0".into(),
                copy_from: None,
            },
            EditorCommand::ApplyTextDelta {
                file_token: "f1.0".into(),
                base_checksum: None,
            },
            EditorCommand::TextDeltaChunk {
                file_token: "f1.0".into(),
                chunk: b"SVN\0\x00\x00\x03\x01\x03\x83abc( ) \n".to_vec(),
            },
            EditorCommand::TextDeltaEnd {
                file_token: "f1.0".into(),
            },
            EditorCommand::CloseFile {
                file_token: "f1.0".into(),
                text_checksum: Some("900150983cd24fb0d6963f7d28e17f72".into()),
            },
            EditorCommand::CloseDir {
                dir_token: "d0.0".into(),
            },
            EditorCommand::CloseEdit,
        ];
        let bytes = encode_commands(&commands).unwrap();

        let mut decoder = CommandDecoder::new();
        let mut decoded = Vec::new();
        for chunk in bytes.chunks(7) {
            decoder.push(chunk);
            while let Some(cmd) = decoder.next_command().unwrap() {
                decoded.push(cmd);
            }
        }
        decoder.finish().unwrap();
        assert_eq!(decoded, commands);
    }

    #[test]
    fn parse_rejects_unknown_and_short_commands() {
        let err = decode_commands(b"( frobnicate ( ) ) \n").unwrap_err();
        assert!(matches!(err, SvnError::Protocol(msg) if msg.contains("frobnicate")));

        let err = decode_commands(b"( add-file ( 1:a ) ) \n").unwrap_err();
        assert!(matches!(err, SvnError::Protocol(_)));

        let err = decode_commands(b"( close-dir ( ) ) \n").unwrap_err();
        assert!(matches!(err, SvnError::Protocol(_)));
    }

    #[test]
    fn parse_rejects_unsafe_paths_from_the_wire() {
        let err = decode_commands(b"( delete-entry ( 6:../etc ( ) 4:d0.0 ) ) \n").unwrap_err();
        assert!(matches!(err, SvnError::InvalidPath(_)));
    }

    #[test]
    fn truncated_stream_is_reported_by_finish() {
        let mut decoder = CommandDecoder::new();
        decoder.push(b"( close-edit ( ");
        assert!(decoder.next_command().unwrap().is_none());
        assert!(decoder.finish().is_err());
    }
}
