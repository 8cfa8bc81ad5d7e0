//! El Torito boot-catalog interval parsing.
//!
//! `xorriso -report_el_torito as_mkisofs` describes the boot partition
//! of an existing ISO as an interval spec:
//!
//! `--interval:<filesystem>:<start><unit>-<stop><unit>:<zero>:'<path>'`
//!
//! Only the single-interval report shape is handled; a second interval
//! line (separate BIOS and UEFI partitions) is ignored.

use crate::errors::{ImprintError, Result};
use std::path::Path;

/// Block-size suffix map used by the interval grammar.
pub fn unit_bytes(unit: char) -> Option<u64> {
    Some(match unit {
        'k' => 1024,
        'm' => 1024 * 1024,
        'g' => 1024 * 1024 * 1024,
        't' => 1024 * 1024 * 1024 * 1024,
        's' => 2048,
        'd' => 512,
        _ => return None,
    })
}

/// One parsed boot-catalog interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootCatalogInterval {
    pub filesystem: String,
    pub start: u64,
    pub stop: u64,
    pub unit: char,
    pub zero: String,
}

impl BootCatalogInterval {
    /// Inclusive range: `stop - start + 1` blocks.
    pub fn block_count(&self) -> u64 {
        self.stop - self.start + 1
    }

    pub fn unit_bytes(&self) -> u64 {
        // Validated at parse time.
        unit_bytes(self.unit).unwrap_or(512)
    }

    /// Render the interval back as an `--interval:` argument pointing at
    /// `blob`, keeping the original coordinates so the rebuilt catalog
    /// addresses the boot image at the same absolute blocks. The path
    /// goes in unquoted: the spec travels as one argv element and never
    /// passes through a shell.
    pub fn as_argument(&self, blob: &Path) -> String {
        format!(
            "--interval:{}:{}{}-{}{}:{}:{}",
            self.filesystem,
            self.start,
            self.unit,
            self.stop,
            self.unit,
            self.zero,
            blob.display()
        )
    }
}

/// Find the first `--interval:` spec in an analysis report.
pub fn parse_report(report: &str) -> Result<BootCatalogInterval> {
    for line in report.lines() {
        let Some(idx) = line.find("--interval:") else {
            continue;
        };
        return parse_interval(&line[idx..]).ok_or_else(|| {
            ImprintError::BootCatalogParseFailure(line.trim().to_string()).into()
        });
    }
    Err(ImprintError::BootCatalogParseFailure("no interval in report".to_string()).into())
}

fn parse_interval(text: &str) -> Option<BootCatalogInterval> {
    let rest = text.strip_prefix("--interval:")?;
    // The trailing field is a quoted path that may itself contain
    // colons, so split off exactly three fields.
    let mut fields = rest.splitn(4, ':');
    let filesystem = fields.next()?;
    let range = fields.next()?;
    let zero = fields.next()?;
    fields.next()?;

    if filesystem.is_empty() || zero.is_empty() {
        return None;
    }
    let (start_tok, stop_tok) = range.split_once('-')?;
    let (start, start_unit) = split_block(start_tok)?;
    let (stop, stop_unit) = split_block(stop_tok)?;
    if start_unit != stop_unit || stop < start {
        return None;
    }
    unit_bytes(start_unit)?;

    Some(BootCatalogInterval {
        filesystem: filesystem.to_string(),
        start,
        stop,
        unit: start_unit,
        zero: zero.to_string(),
    })
}

fn split_block(token: &str) -> Option<(u64, char)> {
    let unit = token.chars().last().filter(char::is_ascii_alphabetic)?;
    let value = token[..token.len() - 1].parse().ok()?;
    Some((value, unit))
}
