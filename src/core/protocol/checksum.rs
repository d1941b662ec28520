//! Frame integrity checks
//!
//! Every wire message ends with a CRC-16/CCITT-FALSE trailer stored big-endian.

/// Size of the CRC trailer in bytes
pub const CRC_LEN: usize = 2;

/// CRC-16/CCITT-FALSE
/// Polynomial: 0x1021, Init: 0xFFFF, RefIn: false, RefOut: false, XorOut: 0x0000
pub fn crc16_ccitt(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;

    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }

    crc
}

/// Append the big-endian CRC of `frame` to itself
pub fn append_crc(frame: &mut Vec<u8>) {
    let crc = crc16_ccitt(frame);
    frame.extend_from_slice(&crc.to_be_bytes());
}

/// Split a frame into body and trailer and check the trailer.
///
/// Returns the body on success, `None` when the frame is too short to carry a
/// trailer or when the recomputed CRC differs.
pub fn verify_trailer(frame: &[u8]) -> Option<&[u8]> {
    if frame.len() < CRC_LEN {
        return None;
    }
    let (body, trailer) = frame.split_at(frame.len() - CRC_LEN);
    let expected = u16::from_be_bytes([trailer[0], trailer[1]]);
    (crc16_ccitt(body) == expected).then_some(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_ccitt_check_value() {
        // Test vector: "123456789" should give 0x29B1
        assert_eq!(crc16_ccitt(b"123456789"), 0x29B1);
    }

    #[test]
    fn test_crc16_ccitt_empty() {
        assert_eq!(crc16_ccitt(&[]), 0xFFFF);
    }

    #[test]
    fn test_append_and_verify() {
        let mut frame = b"123456789".to_vec();
        append_crc(&mut frame);
        assert_eq!(&frame[9..], &[0x29, 0xB1]);
        assert_eq!(verify_trailer(&frame), Some(&b"123456789"[..]));
    }

    #[test]
    fn test_verify_rejects_corruption() {
        let mut frame = vec![0x40, 0x01, 0x02];
        append_crc(&mut frame);
        frame[1] ^= 0x10;
        assert!(verify_trailer(&frame).is_none());
        assert!(verify_trailer(&[0x01]).is_none());
    }
}
