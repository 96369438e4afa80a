//! One chunk of a text delta.
//!
//! A [`DeltaWindow`] describes how to build `tview_len` bytes of target text
//! from a view of the source (base) text, the target text produced so far
//! by this window, and a block of new data.

use crate::SvnError;

/// What a [`DeltaOp`] copies from.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeltaAction {
    /// Copy from the source view.
    Source = 0,
    /// Copy from the target view built so far (may overlap the write position).
    Target = 1,
    /// Copy from the window's new data.
    New = 2,
}

impl DeltaAction {
    /// Returns the two-bit action code used by svndiff.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Parses a two-bit svndiff action code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Source),
            1 => Some(Self::Target),
            2 => Some(Self::New),
            _ => None,
        }
    }
}

/// One copy/insert instruction of a [`DeltaWindow`].
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DeltaOp {
    /// Where the bytes come from.
    pub action: DeltaAction,
    /// Offset into the source view, the target view, or the new data.
    pub offset: u32,
    /// Number of bytes produced.
    pub length: u32,
}

impl DeltaOp {
    /// Copies `length` bytes from the source view at `offset`.
    pub fn source(offset: u32, length: u32) -> Self {
        Self {
            action: DeltaAction::Source,
            offset,
            length,
        }
    }

    /// Copies `length` bytes from the target view at `offset`.
    pub fn target(offset: u32, length: u32) -> Self {
        Self {
            action: DeltaAction::Target,
            offset,
            length,
        }
    }

    /// Inserts `length` bytes of new data starting at `offset`.
    pub fn new_data(offset: u32, length: u32) -> Self {
        Self {
            action: DeltaAction::New,
            offset,
            length,
        }
    }
}

/// A single window of a text delta.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DeltaWindow {
    /// Offset of the source view in the base text.
    pub sview_offset: u64,
    /// Length of the source view.
    pub sview_len: u32,
    /// Length of the target text produced by this window.
    pub tview_len: u32,
    /// Number of ops that copy from the source view.
    pub src_ops: i32,
    /// Instructions, applied in order.
    pub ops: Vec<DeltaOp>,
    /// Bytes [`DeltaAction::New`] ops copy from.
    pub new_data: Vec<u8>,
}

impl DeltaWindow {
    /// Builds a window that inserts `data` verbatim.
    pub fn insertion(data: impl Into<Vec<u8>>) -> Self {
        let new_data = data.into();
        let len = new_data.len() as u32;
        let ops = if len == 0 {
            Vec::new()
        } else {
            vec![DeltaOp::new_data(0, len)]
        };
        Self {
            sview_offset: 0,
            sview_len: 0,
            tview_len: len,
            src_ops: 0,
            ops,
            new_data,
        }
    }

    /// Builds a window from a source view and ops, computing `tview_len` and
    /// `src_ops` from the ops.
    pub fn from_ops(
        sview_offset: u64,
        sview_len: u32,
        ops: Vec<DeltaOp>,
        new_data: Vec<u8>,
    ) -> Self {
        let tview_len = ops.iter().map(|op| op.length).sum();
        let src_ops = ops
            .iter()
            .filter(|op| op.action == DeltaAction::Source)
            .count() as i32;
        Self {
            sview_offset,
            sview_len,
            tview_len,
            src_ops,
            ops,
            new_data,
        }
    }

    /// Returns `true` if this window produces no target bytes.
    pub fn is_empty(&self) -> bool {
        self.tview_len == 0
    }

    /// Returns the source view range `(start, end)` in the base text.
    pub fn source_range(&self) -> Result<(usize, usize), SvnError> {
        let start = usize::try_from(self.sview_offset)
            .map_err(|_| SvnError::Protocol("delta source view offset overflows usize".into()))?;
        let end = start
            .checked_add(self.sview_len as usize)
            .ok_or_else(|| SvnError::Protocol("delta source view end overflow".into()))?;
        Ok((start, end))
    }

    /// Applies this window to the full base text, appending to `out`.
    pub fn apply_to_base(&self, base: &[u8], out: &mut Vec<u8>) -> Result<(), SvnError> {
        let (start, end) = self.source_range()?;
        if end > base.len() {
            return Err(SvnError::Protocol(
                "delta source view out of bounds for base".into(),
            ));
        }
        self.apply(&base[start..end], out)
    }

    /// Applies this window to an already extracted source view, appending
    /// the produced target view to `out`.
    pub fn apply(&self, source_view: &[u8], out: &mut Vec<u8>) -> Result<(), SvnError> {
        if source_view.len() != self.sview_len as usize {
            return Err(SvnError::Protocol(
                "delta source view length does not match window".into(),
            ));
        }
        let tview_len = self.tview_len as usize;
        let mut target = Vec::with_capacity(tview_len);

        for op in &self.ops {
            let len = op.length as usize;
            let off = op.offset as usize;
            if len == 0 {
                return Err(SvnError::Protocol("delta instruction has length zero".into()));
            }
            if target.len() + len > tview_len {
                return Err(SvnError::Protocol(
                    "delta instruction overflows target view".into(),
                ));
            }

            match op.action {
                DeltaAction::Source => {
                    if off.checked_add(len).is_none_or(|end| end > source_view.len()) {
                        return Err(SvnError::Protocol(
                            "delta [src] instruction overflows source view".into(),
                        ));
                    }
                    target.extend_from_slice(&source_view[off..off + len]);
                }
                DeltaAction::Target => {
                    if off >= target.len() {
                        return Err(SvnError::Protocol(
                            "delta [tgt] instruction starts beyond target view position".into(),
                        ));
                    }
                    // Byte-wise so overlapping ranges repeat earlier output.
                    for i in 0..len {
                        let b = target[off + i];
                        target.push(b);
                    }
                }
                DeltaAction::New => {
                    if off.checked_add(len).is_none_or(|end| end > self.new_data.len()) {
                        return Err(SvnError::Protocol(
                            "delta [new] instruction overflows new data section".into(),
                        ));
                    }
                    target.extend_from_slice(&self.new_data[off..off + len]);
                }
            }
        }

        if target.len() != tview_len {
            return Err(SvnError::Protocol(
                "delta does not fill the target window".into(),
            ));
        }
        out.extend_from_slice(&target);
        Ok(())
    }
}
