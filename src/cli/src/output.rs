//! Table formatting helpers for CLI output.

use a3s_mirror_core::unit::{Category, CategoryCounts};
use comfy_table::{ContentArrangement, Table};

/// Create a styled table with the given headers.
pub fn new_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.load_preset(comfy_table::presets::NOTHING);
    table.set_header(headers);
    table
}

/// Per-category `mirrored / total` table, with a trailing total row.
pub fn counts_table(counts: &CategoryCounts, totals: &CategoryCounts) -> Table {
    let mut table = new_table(&["CATEGORY", "MIRRORED", "TOTAL"]);
    for category in Category::ALL {
        if totals.get(category) == 0 {
            continue;
        }
        table.add_row(vec![
            category.to_string(),
            counts.get(category).to_string(),
            totals.get(category).to_string(),
        ]);
    }
    table.add_row(vec![
        "all".to_string(),
        counts.total().to_string(),
        totals.total().to_string(),
    ]);
    table
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1024), "1.0 KB");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(1048576), "1.0 MB");
        assert_eq!(format_bytes(10 * 1024 * 1024 * 1024), "10.0 GB");
    }

    #[test]
    fn test_counts_table_skips_empty_categories() {
        let counts = CategoryCounts {
            release: 3,
            operator: 1,
            additional: 0,
            helm: 0,
        };
        let totals = CategoryCounts {
            release: 3,
            operator: 2,
            additional: 0,
            helm: 0,
        };
        let rendered = counts_table(&counts, &totals).to_string();
        assert!(rendered.contains("release"));
        assert!(rendered.contains("operator"));
        assert!(!rendered.contains("helm"));
        assert!(!rendered.contains("additional"));
        assert!(rendered.contains("all"));
    }
}
