//! Backwards search for the start of the last N lines of a file.
//!
//! Reads fixed-size blocks from the end towards the start, counting line
//! terminators, so the cost is proportional to the size of the tail and not
//! of the file.

use std::io::SeekFrom;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};

/// Bytes read per backwards step.
pub const TAIL_BLOCK_SIZE: u64 = 4 * 1024;

/// Where the tail of a file begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TailPosition {
    /// Offset of the first byte of the tail.
    pub offset: u64,
    /// Number of lines between `offset` and the end; less than requested
    /// when the file is shorter.
    pub lines: usize,
}

/// Finds where the last `n` lines of the first `size` bytes begin.
///
/// A final line without a terminator counts as a line. The reader's
/// position is left unspecified.
pub async fn tail_offset<R>(reader: &mut R, size: u64, n: usize) -> std::io::Result<TailPosition>
where
    R: AsyncRead + AsyncSeek + Unpin,
{
    if n == 0 || size == 0 {
        return Ok(TailPosition {
            offset: size,
            lines: 0,
        });
    }

    let mut block = vec![0u8; TAIL_BLOCK_SIZE as usize];

    reader.seek(SeekFrom::Start(size - 1)).await?;
    let mut last = [0u8; 1];
    reader.read_exact(&mut last).await?;
    // The terminator of the final line does not start a new one.
    let mut end = if last[0] == b'\n' { size - 1 } else { size };

    let mut found = 0usize;
    while end > 0 {
        let start = end.saturating_sub(TAIL_BLOCK_SIZE);
        let len = (end - start) as usize;
        reader.seek(SeekFrom::Start(start)).await?;
        reader.read_exact(&mut block[..len]).await?;

        for i in (0..len).rev() {
            if block[i] == b'\n' {
                found += 1;
                if found == n {
                    return Ok(TailPosition {
                        offset: start + i as u64 + 1,
                        lines: n,
                    });
                }
            }
        }
        end = start;
    }

    Ok(TailPosition {
        offset: 0,
        lines: found + 1,
    })
}
