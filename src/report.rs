//! Shared pieces of the heap introspection walks: byte counters and the
//! colored rendering used by the arenas' heap maps.

use core::fmt;

use owo_colors::OwoColorize;

/// Byte counters describing the current state of an arena.
///
/// Produced by a linear walk over every block in region order. As long as
/// no operation has reported [`BlockError::Internal`], `used + free ==
/// total` holds.
///
/// [`BlockError::Internal`]: crate::BlockError::Internal
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// The size in bytes of the managed region.
    ///
    /// For a buddy arena this is the main heap; the emergency heap keeps
    /// its own statistics.
    pub total: u32,
    /// Bytes in blocks currently handed out, including rounding slack.
    pub used: u32,
    /// Bytes in blocks available for allocation.
    pub free: u32,
}

impl HeapStats {
    /// Bytes accounted to neither a live nor a free block.
    ///
    /// Non-zero only after the block partition has been corrupted.
    pub fn missing(&self) -> u32 {
        self.total.saturating_sub(self.used + self.free)
    }
}

/// Writes one block token: the decimal block size, red for used and green
/// for free, followed by a separator.
pub(crate) fn write_block(f: &mut fmt::Formatter<'_>, size: u32, used: bool) -> fmt::Result {
    if used {
        write!(f, "{}|", size.red())
    } else {
        write!(f, "{}|", size.green())
    }
}

/// Writes the totals that follow the token line.
pub(crate) fn write_totals(f: &mut fmt::Formatter<'_>, stats: &HeapStats) -> fmt::Result {
    let percent = if stats.total == 0 {
        0
    } else {
        (u64::from(stats.used) * 100 / u64::from(stats.total)) as u32
    };

    writeln!(f)?;
    writeln!(f, "Total    : {:09}", stats.total)?;
    writeln!(
        f,
        "{}{}",
        format_args!("Used     : {:09}", stats.used).red(),
        format_args!(" ({}%)", percent).red()
    )?;
    writeln!(f, "{}", format_args!("Free     : {:09}", stats.free).green())?;

    if stats.missing() > 0 {
        writeln!(f, "{}", format_args!("missing: {:09}", stats.missing()).red())?;
    }

    Ok(())
}
