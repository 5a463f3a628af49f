//! Conversion between register words and typed values
//!
//! Modbus transfers registers in network order, so a single word already holds
//! the big-endian 16-bit value. The order of words inside 32-bit values and of
//! characters inside string registers varies between devices and is taken
//! from the mapping.

use crate::error::{DecodeError, EncodeError};
use crate::mapping::{ByteOrder, DataType, RegisterMapping, Value, WordOrder};

/// Combine two words into a 32-bit value
pub fn merge_words(words: [u16; 2], order: WordOrder) -> u32 {
    let (high, low) = match order {
        WordOrder::HighFirst => (words[0], words[1]),
        WordOrder::LowFirst => (words[1], words[0]),
    };
    (u32::from(high) << 16) | u32::from(low)
}

/// Split a 32-bit value into two words, inverse of [`merge_words`]
pub fn split_u32(value: u32, order: WordOrder) -> [u16; 2] {
    let high = (value >> 16) as u16;
    let low = value as u16;
    match order {
        WordOrder::HighFirst => [high, low],
        WordOrder::LowFirst => [low, high],
    }
}

/// Bit `index` (0 = least significant) of a register word
pub fn bit_of(word: u16, index: u8) -> bool {
    (word >> index) & 1 == 1
}

/// `word` with bit `index` set to `value`
pub fn with_bit(word: u16, index: u8, value: bool) -> u16 {
    if value {
        word | (1 << index)
    } else {
        word & !(1 << index)
    }
}

fn word_bytes(word: u16, order: ByteOrder) -> [u8; 2] {
    match order {
        ByteOrder::HighFirst => word.to_be_bytes(),
        ByteOrder::LowFirst => word.to_le_bytes(),
    }
}

/// Two latin-1 characters per word, trailing NULs trimmed
pub fn words_to_string(words: &[u16], order: ByteOrder) -> String {
    let mut bytes: Vec<u8> = words.iter().flat_map(|w| word_bytes(*w, order)).collect();
    while bytes.last() == Some(&0) {
        bytes.pop();
    }
    bytes.into_iter().map(char::from).collect()
}

/// Pack `value` into exactly `register_count` words, padding with NULs
pub fn string_to_words(
    value: &str,
    register_count: u16,
    order: ByteOrder,
) -> Result<Vec<u16>, EncodeError> {
    let capacity = usize::from(register_count) * 2;
    let mut bytes = Vec::with_capacity(capacity);
    for ch in value.chars() {
        let byte = u8::try_from(u32::from(ch)).map_err(|_| EncodeError::UnencodableChar(ch))?;
        bytes.push(byte);
    }
    if bytes.len() > capacity {
        return Err(EncodeError::StringTooLong {
            len: bytes.len(),
            capacity,
        });
    }
    bytes.resize(capacity, 0);

    Ok(bytes
        .chunks_exact(2)
        .map(|pair| match order {
            ByteOrder::HighFirst => u16::from_be_bytes([pair[0], pair[1]]),
            ByteOrder::LowFirst => u16::from_le_bytes([pair[0], pair[1]]),
        })
        .collect())
}

/// Decode the words of a register-backed mapping.
///
/// `words` must hold exactly `mapping.register_count()` entries.
pub fn decode_words(mapping: &RegisterMapping, words: &[u16]) -> Result<Value, DecodeError> {
    let expected = usize::from(mapping.register_count());
    if words.len() != expected {
        return Err(DecodeError::LengthMismatch {
            expected,
            actual: words.len(),
        });
    }

    let order = mapping.word_order();
    let value = match mapping.data_type() {
        DataType::Bool => match mapping.bit_index() {
            Some(index) => Value::Bool(bit_of(words[0], index)),
            None => Value::Bool(words[0] != 0),
        },
        DataType::Int16 => Value::Int16(words[0] as i16),
        DataType::UInt16 => Value::UInt16(words[0]),
        DataType::Int32 => Value::Int32(merge_words([words[0], words[1]], order) as i32),
        DataType::UInt32 => Value::UInt32(merge_words([words[0], words[1]], order)),
        DataType::Float => {
            Value::Float(f32::from_bits(merge_words([words[0], words[1]], order)))
        }
        DataType::String => Value::String(words_to_string(words, mapping.byte_order())),
    };

    Ok(value)
}

/// Decode a coil or discrete input mapping from its bit
pub fn decode_bits(bits: &[bool]) -> Result<Value, DecodeError> {
    match bits {
        [bit] => Ok(Value::Bool(*bit)),
        _ => Err(DecodeError::LengthMismatch {
            expected: 1,
            actual: bits.len(),
        }),
    }
}

/// Encode a value into the words written to a register-backed mapping.
///
/// Bit-in-register mappings encode to a word with only their bit set; the
/// write path merges that into the current register content instead.
pub fn encode_value(mapping: &RegisterMapping, value: &Value) -> Result<Vec<u16>, EncodeError> {
    let mismatch = || EncodeError::TypeMismatch {
        name: mapping.name().to_string(),
        expected: mapping.data_type(),
    };
    let order = mapping.word_order();

    let words = match (mapping.data_type(), value) {
        (DataType::Bool, Value::Bool(v)) => match mapping.bit_index() {
            Some(index) => vec![with_bit(0, index, *v)],
            None => vec![u16::from(*v)],
        },
        (DataType::Int16, Value::Int16(v)) => vec![*v as u16],
        (DataType::UInt16, Value::UInt16(v)) => vec![*v],
        (DataType::Int32, Value::Int32(v)) => split_u32(*v as u32, order).to_vec(),
        (DataType::UInt32, Value::UInt32(v)) => split_u32(*v, order).to_vec(),
        (DataType::Float, Value::Float(v)) => split_u32(v.to_bits(), order).to_vec(),
        (DataType::String, Value::String(v)) => {
            string_to_words(v, mapping.register_count(), mapping.byte_order())?
        }
        _ => return Err(mismatch()),
    };

    Ok(words)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::RegisterType;

    fn holding(data_type: DataType) -> RegisterMapping {
        RegisterMapping::new("m", RegisterType::Holding, 0, data_type).unwrap()
    }

    fn round_trip(mapping: &RegisterMapping, words: &[u16]) -> Vec<u16> {
        let value = decode_words(mapping, words).unwrap();
        encode_value(mapping, &value).unwrap()
    }

    #[test]
    fn test_bit_extraction() {
        let word = 0b0000_0000_0000_0101;
        let decode = |index| {
            let mapping = RegisterMapping::bit("b", RegisterType::Holding, 0, index).unwrap();
            decode_words(&mapping, &[word]).unwrap()
        };

        assert_eq!(decode(0), Value::Bool(true));
        assert_eq!(decode(1), Value::Bool(false));
        assert_eq!(decode(2), Value::Bool(true));
        assert_eq!(decode(15), Value::Bool(false));
    }

    #[test]
    fn test_int32_word_order() {
        let standard = holding(DataType::Int32);
        let swapped = holding(DataType::Int32).with_word_order(WordOrder::LowFirst);

        assert_eq!(decode_words(&standard, &[0x0001, 0x0000]).unwrap(), Value::Int32(65536));
        // low word first: 0x0001 is the low half
        assert_eq!(decode_words(&swapped, &[0x0001, 0x0000]).unwrap(), Value::Int32(1));
    }

    #[test]
    fn test_signed_16bit() {
        let mapping = holding(DataType::Int16);
        assert_eq!(decode_words(&mapping, &[0xFFFF]).unwrap(), Value::Int16(-1));
        assert_eq!(decode_words(&mapping, &[0xFF9C]).unwrap(), Value::Int16(-100));

        let mapping = holding(DataType::UInt16);
        assert_eq!(decode_words(&mapping, &[0xFFFF]).unwrap(), Value::UInt16(65535));
    }

    #[test]
    fn test_signed_32bit() {
        let mapping = holding(DataType::Int32);
        assert_eq!(decode_words(&mapping, &[0xFFFF, 0xFF9C]).unwrap(), Value::Int32(-100));
    }

    #[test]
    fn test_float_decode() {
        let mapping = holding(DataType::Float);
        let bits = 1.0_f32.to_bits();
        let words = [(bits >> 16) as u16, bits as u16];
        assert_eq!(decode_words(&mapping, &words).unwrap(), Value::Float(1.0));

        let swapped = holding(DataType::Float).with_word_order(WordOrder::LowFirst);
        assert_eq!(
            decode_words(&swapped, &[words[1], words[0]]).unwrap(),
            Value::Float(1.0)
        );
    }

    #[test]
    fn test_string_decode_trims_nul() {
        let mapping = RegisterMapping::string("s", RegisterType::Holding, 0, 3).unwrap();
        let value = decode_words(&mapping, &[0x4142, 0x4300, 0x0000]).unwrap();
        assert_eq!(value, Value::String("ABC".to_string()));
    }

    #[test]
    fn test_string_byte_order() {
        let high = RegisterMapping::string("s", RegisterType::Holding, 0, 2).unwrap();
        let low = RegisterMapping::string("s", RegisterType::Holding, 0, 2)
            .unwrap()
            .with_byte_order(ByteOrder::LowFirst);

        assert_eq!(
            decode_words(&low, &[0x4241, 0x0043]).unwrap(),
            Value::String("ABC".to_string())
        );
        assert_eq!(
            encode_value(&low, &Value::String("ABC".to_string())).unwrap(),
            vec![0x4241, 0x0043]
        );
        assert_eq!(
            encode_value(&high, &Value::String("ABC".to_string())).unwrap(),
            vec![0x4142, 0x4300]
        );
        assert_eq!(round_trip(&low, &[0x4443, 0x4645]), vec![0x4443, 0x4645]);
        assert_eq!(round_trip(&high, &[0x4344, 0x4546]), vec![0x4344, 0x4546]);
    }

    #[test]
    fn test_whole_register_bool() {
        let mapping = holding(DataType::Bool);
        assert_eq!(decode_words(&mapping, &[0]).unwrap(), Value::Bool(false));
        assert_eq!(decode_words(&mapping, &[100]).unwrap(), Value::Bool(true));
        assert_eq!(encode_value(&mapping, &Value::Bool(true)).unwrap(), vec![1]);
    }

    #[test]
    fn test_round_trip_per_type() {
        assert_eq!(round_trip(&holding(DataType::UInt16), &[0xBEEF]), vec![0xBEEF]);
        assert_eq!(round_trip(&holding(DataType::Int16), &[0x8000]), vec![0x8000]);
        assert_eq!(
            round_trip(&holding(DataType::UInt32), &[0xDEAD, 0xBEEF]),
            vec![0xDEAD, 0xBEEF]
        );
        assert_eq!(
            round_trip(
                &holding(DataType::UInt32).with_word_order(WordOrder::LowFirst),
                &[0xBEEF, 0xDEAD]
            ),
            vec![0xBEEF, 0xDEAD]
        );
        assert_eq!(
            round_trip(&holding(DataType::Int32), &[0xFFFF, 0xFFFE]),
            vec![0xFFFF, 0xFFFE]
        );

        let minus_one_and_half = (-1.5_f32).to_bits();
        let float_words = [(minus_one_and_half >> 16) as u16, minus_one_and_half as u16];
        assert_eq!(round_trip(&holding(DataType::Float), &float_words), float_words.to_vec());

        let string = RegisterMapping::string("s", RegisterType::Holding, 0, 1).unwrap();
        assert_eq!(round_trip(&string, &[0x4142]), vec![0x4142]);

        let bit = RegisterMapping::bit("b", RegisterType::Holding, 0, 3).unwrap();
        assert_eq!(round_trip(&bit, &[0b1000]), vec![0b1000]);
    }

    #[test]
    fn test_decoded_values_match_inputs() {
        let value = decode_words(&holding(DataType::UInt32), &[0xDEAD, 0xBEEF]).unwrap();
        assert_eq!(value, Value::UInt32(0xDEAD_BEEF));

        let words = encode_value(&holding(DataType::Float), &Value::Float(-1.5)).unwrap();
        assert_eq!(
            decode_words(&holding(DataType::Float), &words).unwrap(),
            Value::Float(-1.5)
        );
    }

    #[test]
    fn test_length_mismatch_is_decode_error() {
        let err = decode_words(&holding(DataType::UInt32), &[1]).unwrap_err();
        assert_eq!(err, DecodeError::LengthMismatch { expected: 2, actual: 1 });

        let err = decode_bits(&[]).unwrap_err();
        assert_eq!(err, DecodeError::LengthMismatch { expected: 1, actual: 0 });
    }

    #[test]
    fn test_encode_type_mismatch() {
        let err = encode_value(&holding(DataType::UInt16), &Value::Int32(5)).unwrap_err();
        assert!(matches!(err, EncodeError::TypeMismatch { expected: DataType::UInt16, .. }));
    }

    #[test]
    fn test_string_encoding_limits() {
        let order = ByteOrder::HighFirst;
        assert_eq!(string_to_words("ABC", 2, order).unwrap(), vec![0x4142, 0x4300]);
        assert_eq!(
            string_to_words("ABCDE", 2, order).unwrap_err(),
            EncodeError::StringTooLong { len: 5, capacity: 4 }
        );
        assert_eq!(
            string_to_words("€", 2, order).unwrap_err(),
            EncodeError::UnencodableChar('€')
        );
    }

    #[test]
    fn test_with_bit() {
        assert_eq!(with_bit(0b0101, 1, true), 0b0111);
        assert_eq!(with_bit(0b0101, 0, false), 0b0100);
        assert_eq!(with_bit(0b0101, 2, true), 0b0101);
        assert_eq!(with_bit(0, 15, true), 0x8000);
    }
}
