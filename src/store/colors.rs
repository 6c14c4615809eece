// =============================================================================
// Color palette
// =============================================================================
//
// Colors come from a 13-bit palette: 5 bits red, 5 bits green, 3 bits blue,
// each scaled to 8 bits. Candidates that are too dark or too bright to read
// on the chart (relative luminance outside (0.2, 0.9)) are excluded, which
// also removes pure black and pure white.
//
// The first probe for a pair is derived from its symbol, so a fresh store
// hands out the same colors for the same pairs every time.
// =============================================================================

use std::sync::OnceLock;

const RED_BITS: u32 = 5;
const GREEN_BITS: u32 = 5;
const BLUE_BITS: u32 = 3;

const MIN_LUMINANCE: f64 = 0.2;
const MAX_LUMINANCE: f64 = 0.9;

fn scale(value: u32, bits: u32) -> u8 {
    let max = (1u32 << bits) - 1;
    (value * 255 / max) as u8
}

fn luminance(r: u8, g: u8, b: u8) -> f64 {
    (0.299 * r as f64 + 0.587 * g as f64 + 0.114 * b as f64) / 255.0
}

/// The usable palette as `#rrggbb` strings, in code order.
pub fn palette() -> &'static [String] {
    static PALETTE: OnceLock<Vec<String>> = OnceLock::new();
    PALETTE.get_or_init(|| {
        let mut colors = Vec::new();
        for code in 0u32..(1 << (RED_BITS + GREEN_BITS + BLUE_BITS)) {
            let r = scale(code >> (GREEN_BITS + BLUE_BITS), RED_BITS);
            let g = scale((code >> BLUE_BITS) & ((1 << GREEN_BITS) - 1), GREEN_BITS);
            let b = scale(code & ((1 << BLUE_BITS) - 1), BLUE_BITS);
            let l = luminance(r, g, b);
            if l > MIN_LUMINANCE && l < MAX_LUMINANCE {
                colors.push(format!("#{r:02x}{g:02x}{b:02x}"));
            }
        }
        colors
    })
}

/// Palette index where probing starts for `pair` (FNV-1a of the symbol).
pub fn start_index(pair: &str, len: usize) -> usize {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in pair.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    (hash % len.max(1) as u64) as usize
}

/// First free palette color at or after the pair's start index, wrapping
/// around once.
pub fn pick<F>(pair: &str, palette: &[String], mut is_taken: F) -> Option<String>
where
    F: FnMut(&str) -> bool,
{
    let len = palette.len();
    let start = start_index(pair, len);
    (0..len)
        .map(|i| &palette[(start + i) % len])
        .find(|c| !is_taken(c.as_str()))
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn palette_excludes_black_white_and_extremes() {
        let p = palette();
        assert!(!p.is_empty());
        assert!(!p.iter().any(|c| c == "#000000" || c == "#ffffff"));
        let unique: HashSet<&String> = p.iter().collect();
        assert_eq!(unique.len(), p.len());
    }

    #[test]
    fn start_index_is_stable() {
        let len = palette().len();
        assert_eq!(start_index("BTCUSDT", len), start_index("BTCUSDT", len));
        assert!(start_index("ETHUSDT", len) < len);
    }

    #[test]
    fn pick_skips_taken_colors() {
        let p = palette();
        let first = pick("BTCUSDT", p, |_| false).unwrap();
        let second = pick("BTCUSDT", p, |c| c == first).unwrap();
        assert_ne!(first, second);
        assert!(pick("BTCUSDT", p, |_| true).is_none());
    }
}
