//! PKCS#5 padding, applied by the engine for data operations.

use crate::{HError, error::result::HResult};

/// Pad `data` to a multiple of `block_size`
pub(crate) fn pad(data: &mut Vec<u8>, block_size: usize) {
    let pad_len = block_size - data.len() % block_size;
    // block sizes are 8 or 16
    #[allow(clippy::cast_possible_truncation)]
    data.resize(data.len() + pad_len, pad_len as u8);
}

/// Length of the data once the padding is removed
pub(crate) fn unpadded_len(data: &[u8], block_size: usize) -> HResult<usize> {
    let bad_padding = || HError::BadPadding("invalid PKCS#5 padding".to_owned());
    let pad_len = usize::from(*data.last().ok_or_else(bad_padding)?);
    if pad_len == 0 || pad_len > block_size || pad_len > data.len() {
        return Err(bad_padding());
    }
    let (content, padding) = data.split_at(data.len() - pad_len);
    if padding.iter().any(|b| usize::from(*b) != pad_len) {
        return Err(bad_padding());
    }
    Ok(content.len())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::{pad, unpadded_len};
    use crate::HError;

    #[test]
    fn test_pad() {
        let mut data = vec![1_u8; 5];
        pad(&mut data, 8);
        assert_eq!(data, [1, 1, 1, 1, 1, 3, 3, 3]);

        let mut aligned = vec![0_u8; 16];
        pad(&mut aligned, 16);
        assert_eq!(aligned.len(), 32);
        assert!(aligned[16..].iter().all(|b| *b == 16));
        assert_eq!(unpadded_len(&aligned, 16).unwrap(), 16);
    }

    #[test]
    fn test_bad_padding() {
        for data in [
            vec![],
            vec![1, 2, 3, 0],
            vec![1, 2, 3, 9],
            vec![1, 2, 2, 3],
        ] {
            assert!(matches!(
                unpadded_len(&data, 8),
                Err(HError::BadPadding(_))
            ));
        }
        assert_eq!(unpadded_len(&[7, 2, 2], 8).unwrap(), 1);
    }
}
