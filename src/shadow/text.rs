//! Human readable dumps of the shadow around an address.
//!
//! The format is meant for people reading a report, not for parsing.

use std::fmt::Write;

use super::{Shadow, ShadowMarker, GRANULE};
use crate::util::layout::align_down;

/// Shadow bytes printed per row.
const BYTES_PER_ROW: usize = 8;

/// Rows printed on each side of the row holding the address.
const ROWS_AROUND: isize = 4;

/// Legend appended after every dump.
const LEGEND: &[(&str, &str)] = &[
    ("Addressable", "00"),
    ("Partially addressable", "01 - 07"),
    ("Block start redzone", "e0 - ef"),
    ("Internal memory byte", "f1"),
    ("Invalid address", "f2"),
    ("User redzone", "f3"),
    ("Block end redzone", "f4 - f5"),
    ("Heap left redzone", "fa"),
    ("Heap right redzone", "fb"),
    ("Reserved byte", "fc"),
    ("Freed heap region", "fd"),
];

impl Shadow {
    /// Append the shadow rows around `addr` (without legend) to `out`.
    ///
    /// The granule holding `addr` is bracketed and its row marked `=>`.
    pub fn append_shadow_array_text(&self, addr: usize, out: &mut String) {
        let row_span = BYTES_PER_ROW * GRANULE;
        let center = align_down(addr, row_span);
        let bug_granule = align_down(addr, GRANULE);

        for row in -ROWS_AROUND..=ROWS_AROUND {
            let offset = row * row_span as isize;
            let row_start = match center.checked_add_signed(offset) {
                Some(start) => start,
                None => continue,
            };
            let prefix = if row == 0 { "=>" } else { "  " };
            let _ = write!(out, "{}{:#018x}:", prefix, row_start);
            for column in 0..BYTES_PER_ROW {
                let granule = row_start.wrapping_add(column * GRANULE);
                let marker = self.marker_for(granule);
                if granule == bug_granule {
                    let _ = write!(out, "[{:02x}]", marker);
                } else if granule == bug_granule.wrapping_add(GRANULE) && column != 0 {
                    let _ = write!(out, "{:02x}", marker);
                } else {
                    let _ = write!(out, " {:02x}", marker);
                }
            }
            out.push('\n');
        }
    }

    /// Append the rows around `addr` followed by the marker legend.
    pub fn append_shadow_memory_text(&self, addr: usize, out: &mut String) {
        out.push_str("Shadow bytes around the buggy address:\n");
        self.append_shadow_array_text(addr, out);
        let _ = writeln!(
            out,
            "Shadow byte legend (one shadow byte represents {} application bytes):",
            GRANULE
        );
        for (name, values) in LEGEND {
            let _ = writeln!(out, "  {:<23}{}", format!("{}:", name), values);
        }
    }

    /// The full text dump for `addr`.
    pub fn shadow_memory_text(&self, addr: usize) -> String {
        let mut out = String::new();
        self.append_shadow_memory_text(addr, &mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dump_brackets_the_buggy_granule() {
        let buf = vec![0u64; 128];
        let base = buf.as_ptr() as usize;
        let shadow = Shadow::new(base, buf.len() * 8);
        shadow.poison(base + 512, 8, ShadowMarker::FREED);

        let text = shadow.shadow_memory_text(base + 515);
        assert!(text.starts_with("Shadow bytes around the buggy address:\n"));
        assert!(text.contains("[fd]"));
        assert_eq!(text.matches("=>").count(), 1);
        assert!(text.contains("Freed heap region:"));
        assert!(text.contains("Partially addressable: 01 - 07"));

        // Nine rows before the legend.
        let rows = text
            .lines()
            .skip(1)
            .take_while(|line| !line.starts_with("Shadow byte legend"))
            .count();
        assert_eq!(rows, 9);
    }

    #[test]
    fn test_out_of_window_rows_read_invalid() {
        let buf = vec![0u64; 8];
        let base = buf.as_ptr() as usize;
        let shadow = Shadow::new(base, buf.len() * 8);
        let mut text = String::new();
        shadow.append_shadow_array_text(base, &mut text);
        assert!(text.contains("f2"));
        assert!(text.contains(&format!("{:02x}", ShadowMarker::ADDRESSABLE)));
    }
}
