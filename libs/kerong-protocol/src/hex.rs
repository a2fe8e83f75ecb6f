//! Hex formatting for frame logs

use std::fmt::Write;

/// Format bytes as space separated uppercase hex
/// Example: [0x02, 0x01, 0x80] -> "02 01 80"
pub fn format_frame(data: &[u8]) -> String {
    let mut result = String::with_capacity(data.len() * 3);
    for (i, byte) in data.iter().enumerate() {
        if i > 0 {
            result.push(' ');
        }
        // Writing to String buffer is infallible
        let _ = write!(&mut result, "{:02X}", byte);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_frame_basic() {
        assert_eq!(format_frame(&[0x02, 0x01, 0x80]), "02 01 80");
    }

    #[test]
    fn test_format_frame_empty() {
        assert_eq!(format_frame(&[]), "");
    }

    #[test]
    fn test_format_frame_single_byte() {
        assert_eq!(format_frame(&[0x0F]), "0F");
        assert_eq!(format_frame(&[0xFF]), "FF");
    }
}
