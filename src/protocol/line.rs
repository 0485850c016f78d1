//! Splits an arbitrarily chunked byte stream into CR LF terminated frames.
//!
//! Bytes are appended with [`LineAssembler::push`], which returns a lazy iterator
//! over the frames completed so far. A frame is only yielded once both terminator
//! bytes have been seen, so a CR at the end of one chunk followed by LF at the
//! start of the next is reassembled before the frame is released. Frames the
//! caller does not consume stay buffered and are yielded by the next call.

use bytes::{Bytes, BytesMut};

const CR: u8 = b'\r';
const LF: u8 = b'\n';

#[derive(Debug, Default)]
pub struct LineAssembler {
    buffer: BytesMut,
    /// Offset up to which `buffer` is known to contain no CR LF.
    scanned: usize,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4 * 1024),
            scanned: 0,
        }
    }

    /// Appends `chunk` and returns the frames it completes, terminator stripped.
    pub fn push(&mut self, chunk: &[u8]) -> Frames<'_> {
        self.buffer.extend_from_slice(chunk);
        Frames { assembler: self }
    }

    /// Number of bytes of the pending, not yet terminated line.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    fn next_frame(&mut self) -> Option<Bytes> {
        let eol = self.buffer[self.scanned..]
            .windows(2)
            .position(|w| w[0] == CR && w[1] == LF)
            .map(|pos| pos + self.scanned);

        match eol {
            Some(pos) => {
                let mut line = self.buffer.split_to(pos + 2);
                line.truncate(pos);
                self.scanned = 0;
                Some(line.freeze())
            }
            None => {
                // A trailing CR may still be completed by the next chunk.
                self.scanned = self.buffer.len().saturating_sub(1);
                None
            }
        }
    }
}

/// Frames completed by one [`LineAssembler::push`].
pub struct Frames<'a> {
    assembler: &'a mut LineAssembler,
}

impl Iterator for Frames<'_> {
    type Item = Bytes;

    fn next(&mut self) -> Option<Bytes> {
        self.assembler.next_frame()
    }
}
