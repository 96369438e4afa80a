//! Text-delta streaming: the producer-side handler, the consumer-side
//! applier, and delta generation.

use std::collections::HashMap;

use md5::{Digest, Md5};

use crate::options::DELTA_WINDOW_SIZE;
use crate::window::{DeltaOp, DeltaWindow};
use crate::{SvnError, SvndiffOptions};

const MATCH_BLOCKSIZE: usize = 64;

/// Returns the lowercase hex MD5 digest of `data`.
pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// Destination for the windows of one text delta.
pub(crate) trait DeltaTarget {
    fn window(&mut self, window: &DeltaWindow) -> Result<(), SvnError>;
    fn end(&mut self) -> Result<Option<String>, SvnError>;
}

/// Streams the windows of one file's text delta.
///
/// Call [`send`](Self::send) with each window in order, then once with
/// `None` (or call [`finish`](Self::finish)). After that the handler is
/// spent: it has released its hold on the edit and every further call fails.
pub struct TxDeltaHandler<'a> {
    target: Option<Box<dyn DeltaTarget + 'a>>,
    windows: u64,
}

impl std::fmt::Debug for TxDeltaHandler<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxDeltaHandler")
            .field("finished", &self.target.is_none())
            .field("windows", &self.windows)
            .finish()
    }
}

impl<'a> TxDeltaHandler<'a> {
    pub(crate) fn new(target: Box<dyn DeltaTarget + 'a>) -> Self {
        Self {
            target: Some(target),
            windows: 0,
        }
    }

    /// Sends one window, or the end-of-stream sentinel when `window` is `None`.
    ///
    /// The sentinel returns the checksum of the resulting text if the
    /// consumer computed one.
    pub fn send(&mut self, window: Option<&DeltaWindow>) -> Result<Option<String>, SvnError> {
        let Some(target) = self.target.as_mut() else {
            return Err(SvnError::Protocol(
                "text delta handler already received its final window".into(),
            ));
        };
        match window {
            Some(window) => {
                target.window(window)?;
                self.windows += 1;
                Ok(None)
            }
            None => {
                let checksum = target.end()?;
                self.target = None;
                Ok(checksum)
            }
        }
    }

    /// Sends every window of `windows` and then the sentinel.
    pub fn send_all<'w>(
        &mut self,
        windows: impl IntoIterator<Item = &'w DeltaWindow>,
    ) -> Result<Option<String>, SvnError> {
        for window in windows {
            self.send(Some(window))?;
        }
        self.send(None)
    }

    /// Sends the end-of-stream sentinel.
    pub fn finish(mut self) -> Result<Option<String>, SvnError> {
        self.send(None)
    }

    /// Returns `true` once the sentinel has been sent.
    pub fn is_finished(&self) -> bool {
        self.target.is_none()
    }

    /// Number of windows sent so far.
    pub fn windows_sent(&self) -> u64 {
        self.windows
    }
}

impl Drop for TxDeltaHandler<'_> {
    fn drop(&mut self) {
        if self.target.is_some() {
            tracing::debug!(
                windows = self.windows,
                "text delta handler dropped before its final window"
            );
        }
    }
}

/// Rebuilds a text from its base and a sequence of delta windows.
///
/// Windows must arrive in the order they were produced: each one appends the
/// next stretch of target text.
#[derive(Debug)]
pub struct TextDeltaApplier {
    path: String,
    base: Vec<u8>,
    target: Vec<u8>,
    hasher: Md5,
}

impl TextDeltaApplier {
    /// Creates an applier for the file at `path` with base text `base`.
    pub fn new(path: impl Into<String>, base: Vec<u8>) -> Self {
        Self {
            path: path.into(),
            base,
            target: Vec::new(),
            hasher: Md5::new(),
        }
    }

    /// Verifies the base text against the producer's expected checksum.
    pub fn check_base_checksum(&self, expected: Option<&str>) -> Result<(), SvnError> {
        let Some(expected) = expected else {
            return Ok(());
        };
        let actual = md5_hex(&self.base);
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(SvnError::ChecksumMismatch {
                path: self.path.clone(),
                expected: expected.to_string(),
                actual,
            });
        }
        Ok(())
    }

    /// Applies the next window.
    pub fn apply(&mut self, window: &DeltaWindow) -> Result<(), SvnError> {
        let start = self.target.len();
        window.apply_to_base(&self.base, &mut self.target)?;
        self.hasher.update(&self.target[start..]);
        Ok(())
    }

    /// Number of target bytes produced so far.
    pub fn produced(&self) -> usize {
        self.target.len()
    }

    /// Returns the produced text and its hex MD5.
    pub fn finish(self) -> (Vec<u8>, String) {
        let checksum = hex::encode(self.hasher.finalize());
        (self.target, checksum)
    }

    /// Like [`finish`](Self::finish), but fails if the checksum differs from
    /// `expected`.
    pub fn finish_checked(self, expected: Option<&str>) -> Result<(Vec<u8>, String), SvnError> {
        let path = self.path.clone();
        let (text, actual) = self.finish();
        if let Some(expected) = expected
            && !actual.eq_ignore_ascii_case(expected)
        {
            return Err(SvnError::ChecksumMismatch {
                path,
                expected: expected.to_string(),
                actual,
            });
        }
        Ok((text, actual))
    }
}

/// Produces delta windows turning a source text into a target text.
///
/// Each window covers at most `window_size` bytes of target, paired with the
/// source bytes at the same offset. Within a window, 64-byte blocks of the
/// source view and of the already produced target are indexed; matches are
/// extended in both directions and emitted as copies, everything else as new
/// data.
#[derive(Clone, Copy, Debug)]
pub struct DeltaGenerator {
    window_size: usize,
}

impl Default for DeltaGenerator {
    fn default() -> Self {
        Self {
            window_size: DELTA_WINDOW_SIZE,
        }
    }
}

impl DeltaGenerator {
    /// Creates a generator with a custom window size.
    pub fn new(window_size: usize) -> Self {
        Self {
            window_size: window_size.max(1),
        }
    }

    /// Creates a generator using the window size from `options`.
    pub fn from_options(options: &SvndiffOptions) -> Self {
        Self::new(options.window_size)
    }

    /// Returns the window size.
    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// Computes the windows for `source -> target`.
    ///
    /// An empty target yields no windows.
    pub fn delta_windows(&self, source: &[u8], target: &[u8]) -> Vec<DeltaWindow> {
        target
            .chunks(self.window_size)
            .enumerate()
            .map(|(idx, chunk)| {
                let offset = (idx * self.window_size).min(source.len());
                let end = (offset + self.window_size).min(source.len());
                compute_window(&source[offset..end], offset as u64, chunk)
            })
            .collect()
    }
}

/// Streams the delta from `source` to `target` through `handler`, sentinel
/// included.
pub fn send_delta(
    handler: &mut TxDeltaHandler<'_>,
    generator: &DeltaGenerator,
    source: &[u8],
    target: &[u8],
) -> Result<Option<String>, SvnError> {
    let windows = generator.delta_windows(source, target);
    handler.send_all(windows.iter())
}

#[derive(Clone, Copy)]
struct BlockHash {
    a: u32,
    b: u32,
}

impl BlockHash {
    fn of(block: &[u8]) -> Self {
        let mut a = 0u32;
        let mut b = 0u32;
        for &byte in block {
            a = a.wrapping_add(byte as u32);
            b = b.wrapping_add(a);
        }
        Self { a, b }
    }

    fn roll(&mut self, out: u8, inp: u8) {
        self.a = self.a.wrapping_sub(out as u32).wrapping_add(inp as u32);
        self.b = self
            .b
            .wrapping_sub((MATCH_BLOCKSIZE as u32).wrapping_mul(out as u32))
            .wrapping_add(self.a);
    }

    fn key(self) -> u32 {
        (self.b << 16) ^ self.a
    }
}

fn index_blocks(data: &[u8]) -> HashMap<u32, usize> {
    let mut index = HashMap::new();
    let mut pos = 0;
    while pos + MATCH_BLOCKSIZE <= data.len() {
        index
            .entry(BlockHash::of(&data[pos..pos + MATCH_BLOCKSIZE]).key())
            .or_insert(pos);
        pos += MATCH_BLOCKSIZE;
    }
    index
}

fn forward_match(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

struct OpsBuilder<'t> {
    target: &'t [u8],
    ops: Vec<DeltaOp>,
    new_data: Vec<u8>,
}

impl OpsBuilder<'_> {
    fn literal(&mut self, start: usize, end: usize) {
        if start >= end {
            return;
        }
        let len = (end - start) as u32;
        let offset = self.new_data.len() as u32;
        self.new_data.extend_from_slice(&self.target[start..end]);
        match self.ops.last_mut() {
            Some(last) if last.action == crate::window::DeltaAction::New => last.length += len,
            _ => self.ops.push(DeltaOp::new_data(offset, len)),
        }
    }
}

fn compute_window(source: &[u8], sview_offset: u64, target: &[u8]) -> DeltaWindow {
    let source_index = index_blocks(source);
    let mut target_index: HashMap<u32, usize> = HashMap::new();
    let mut next_target_block = 0usize;

    let mut builder = OpsBuilder {
        target,
        ops: Vec::new(),
        new_data: Vec::new(),
    };
    let mut literal_start = 0usize;
    let mut pos = 0usize;
    let mut hash: Option<BlockHash> = None;

    while pos + MATCH_BLOCKSIZE <= target.len() {
        while next_target_block < pos && next_target_block + MATCH_BLOCKSIZE <= target.len() {
            let indexed = &target[next_target_block..next_target_block + MATCH_BLOCKSIZE];
            target_index
                .entry(BlockHash::of(indexed).key())
                .or_insert(next_target_block);
            next_target_block += MATCH_BLOCKSIZE;
        }

        let current = match hash {
            Some(h) => h,
            None => BlockHash::of(&target[pos..pos + MATCH_BLOCKSIZE]),
        };
        let key = current.key();
        let block = &target[pos..pos + MATCH_BLOCKSIZE];

        // (is_source, match start, match pos in target, length)
        let mut best: Option<(bool, usize, usize, usize)> = None;
        if let Some(&src) = source_index.get(&key)
            && &source[src..src + MATCH_BLOCKSIZE] == block
        {
            let mut start = src;
            let mut at = pos;
            let mut len = forward_match(&source[src..], &target[pos..]);
            while at > literal_start && start > 0 && source[start - 1] == target[at - 1] {
                start -= 1;
                at -= 1;
                len += 1;
            }
            best = Some((true, start, at, len));
        }
        if let Some(&tgt) = target_index.get(&key)
            && tgt < pos
            && &target[tgt..tgt + MATCH_BLOCKSIZE] == block
        {
            let mut len = 0;
            while pos + len < target.len() && target[tgt + len] == target[pos + len] {
                len += 1;
            }
            let mut start = tgt;
            let mut at = pos;
            while at > literal_start && start > 0 && target[start - 1] == target[at - 1] {
                start -= 1;
                at -= 1;
                len += 1;
            }
            if best.is_none_or(|(_, _, _, best_len)| len > best_len) {
                best = Some((false, start, at, len));
            }
        }

        match best {
            Some((is_source, start, at, len)) => {
                builder.literal(literal_start, at);
                let op = if is_source {
                    DeltaOp::source(start as u32, len as u32)
                } else {
                    DeltaOp::target(start as u32, len as u32)
                };
                builder.ops.push(op);
                pos = at + len;
                literal_start = pos;
                hash = None;
            }
            None => {
                if pos + MATCH_BLOCKSIZE < target.len() {
                    let mut next = current;
                    next.roll(target[pos], target[pos + MATCH_BLOCKSIZE]);
                    hash = Some(next);
                }
                pos += 1;
            }
        }
    }
    builder.literal(literal_start, target.len());

    let OpsBuilder { ops, new_data, .. } = builder;
    DeltaWindow::from_ops(sview_offset, source.len() as u32, ops, new_data)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::window::DeltaAction;

    fn rebuild(source: &[u8], windows: &[DeltaWindow]) -> Vec<u8> {
        let mut applier = TextDeltaApplier::new("f", source.to_vec());
        for window in windows {
            applier.apply(window).unwrap();
        }
        applier.finish().0
    }

    fn pseudo_random(len: usize, seed: u32) -> Vec<u8> {
        let mut state = seed;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                (state >> 16) as u8
            })
            .collect()
    }

    #[test]
    fn md5_hex_of_hello() {
        assert_eq!(md5_hex(b"hello"), "5d41402abc4b2a76b9719d911017c592");
    }

    #[test]
    fn generated_delta_reuses_source_blocks() {
        let source = pseudo_random(4096, 7);
        let mut target = source.clone();
        target[2000..2010].copy_from_slice(b"0123456789");

        let windows = DeltaGenerator::default().delta_windows(&source, &target);
        assert_eq!(windows.len(), 1);
        assert!(windows[0].new_data.len() < 256);
        assert!(windows[0].ops.iter().any(|op| op.action == DeltaAction::Source));
        assert_eq!(rebuild(&source, &windows), target);
    }

    #[test]
    fn generated_delta_uses_target_copies_for_repetition() {
        let block = pseudo_random(200, 3);
        let target: Vec<u8> = block.iter().chain(&block).chain(&block).copied().collect();

        let windows = DeltaGenerator::default().delta_windows(&[], &target);
        assert!(windows[0].ops.iter().any(|op| op.action == DeltaAction::Target));
        assert!(windows[0].new_data.len() < target.len());
        assert_eq!(rebuild(&[], &windows), target);
    }

    #[test]
    fn small_windows_cover_long_texts() {
        let source = pseudo_random(1000, 11);
        let mut target = pseudo_random(300, 5);
        target.extend_from_slice(&source);

        let windows = DeltaGenerator::new(256).delta_windows(&source, &target);
        assert_eq!(windows.len(), 6);
        assert!(windows.iter().all(|w| w.tview_len as usize <= 256));
        assert_eq!(rebuild(&source, &windows), target);
    }

    #[test]
    fn empty_target_produces_no_windows() {
        assert!(DeltaGenerator::default().delta_windows(b"abc", b"").is_empty());
        assert_eq!(rebuild(b"abc", &[]), b"");
    }

    #[test]
    fn applier_verifies_base_checksum() {
        let applier = TextDeltaApplier::new("trunk/README", b"hello".to_vec());
        applier.check_base_checksum(None).unwrap();
        applier
            .check_base_checksum(Some("5D41402ABC4B2A76B9719D911017C592"))
            .unwrap();
        let err = applier.check_base_checksum(Some("00")).unwrap_err();
        assert!(matches!(
            err,
            SvnError::ChecksumMismatch { ref path, .. } if path == "trunk/README"
        ));
    }

    #[test]
    fn applier_checks_result_checksum() {
        let mut applier = TextDeltaApplier::new("a", Vec::new());
        applier.apply(&DeltaWindow::insertion(b"hello".to_vec())).unwrap();
        assert_eq!(applier.produced(), 5);
        let err = applier.finish_checked(Some("ffff")).unwrap_err();
        assert!(matches!(err, SvnError::ChecksumMismatch { .. }));
    }

    struct Collect(Rc<RefCell<Vec<DeltaWindow>>>);

    impl DeltaTarget for Collect {
        fn window(&mut self, window: &DeltaWindow) -> Result<(), SvnError> {
            self.0.borrow_mut().push(window.clone());
            Ok(())
        }

        fn end(&mut self) -> Result<Option<String>, SvnError> {
            Ok(Some("done".into()))
        }
    }

    #[test]
    fn handler_rejects_use_after_sentinel() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut handler = TxDeltaHandler::new(Box::new(Collect(Rc::clone(&seen))));

        handler.send(Some(&DeltaWindow::insertion(b"x".to_vec()))).unwrap();
        assert_eq!(handler.send(None).unwrap().as_deref(), Some("done"));
        assert!(handler.is_finished());
        assert_eq!(handler.windows_sent(), 1);
        // The target (and its clone of `seen`) is released at the sentinel.
        assert_eq!(Rc::strong_count(&seen), 1);

        let err = handler.send(Some(&DeltaWindow::default())).unwrap_err();
        assert!(matches!(err, SvnError::Protocol(_)));
        assert!(matches!(handler.send(None), Err(SvnError::Protocol(_))));
    }
}
