//! Minimal reader/writer for the NumPy `.npy` format (versions 1.0 to 3.0).
//!
//! Only floating-point arrays are accepted; every element is widened to `f32`.

use half::f16;

use super::PayloadError;

const MAGIC: &[u8] = b"\x93NUMPY";
const PREAMBLE_LEN: usize = MAGIC.len() + 2;
const HEADER_ALIGNMENT: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endian {
    Little,
    Big,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Element {
    F16,
    F32,
    F64,
}

impl Element {
    fn width(self) -> usize {
        match self {
            Element::F16 => 2,
            Element::F32 => 4,
            Element::F64 => 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Header {
    endian: Endian,
    element: Element,
    fortran_order: bool,
    shape: Vec<usize>,
}

/// Parsed `.npy` array in row-major order.
#[derive(Debug, Clone, PartialEq)]
pub struct NpyArray {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

/// Parses a complete `.npy` file.
pub fn parse(bytes: &[u8]) -> Result<NpyArray, PayloadError> {
    if bytes.len() < PREAMBLE_LEN || &bytes[..MAGIC.len()] != MAGIC {
        return Err(PayloadError::InvalidNpy {
            reason: "missing NUMPY magic".to_string(),
        });
    }

    let major = bytes[MAGIC.len()];
    let (header_len, header_start) = match major {
        1 => {
            let len = read_len::<2>(bytes, PREAMBLE_LEN)?;
            (len, PREAMBLE_LEN + 2)
        }
        2 | 3 => {
            let len = read_len::<4>(bytes, PREAMBLE_LEN)?;
            (len, PREAMBLE_LEN + 4)
        }
        other => {
            return Err(PayloadError::InvalidNpy {
                reason: format!("unsupported format version {}", other),
            });
        }
    };

    let header_end = header_start
        .checked_add(header_len)
        .filter(|&end| end <= bytes.len())
        .ok_or_else(|| PayloadError::InvalidNpy {
            reason: "header extends past end of file".to_string(),
        })?;

    let header_text =
        std::str::from_utf8(&bytes[header_start..header_end]).map_err(|_| {
            PayloadError::InvalidNpy {
                reason: "header is not valid text".to_string(),
            }
        })?;
    let header = parse_header(header_text)?;

    let count = header
        .shape
        .iter()
        .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
        .ok_or_else(|| PayloadError::InvalidNpy {
            reason: "shape overflows".to_string(),
        })?;

    let body = &bytes[header_end..];
    let expected = count
        .checked_mul(header.element.width())
        .ok_or_else(|| PayloadError::InvalidNpy {
            reason: "shape overflows".to_string(),
        })?;
    if body.len() != expected {
        return Err(PayloadError::InvalidNpy {
            reason: format!(
                "expected {} data bytes for shape {:?}, found {}",
                expected,
                header.shape,
                body.len()
            ),
        });
    }

    let mut data = decode_elements(body, header.element, header.endian);
    if header.fortran_order && header.shape.len() > 1 {
        data = fortran_to_c_order(&data, &header.shape);
    }

    Ok(NpyArray {
        shape: header.shape,
        data,
    })
}

/// Serializes a row-major `f32` array as a version 1.0 `.npy` file.
pub fn write(shape: &[usize], data: &[f32]) -> Vec<u8> {
    let shape_text = match shape {
        [single] => format!("({},)", single),
        dims => format!(
            "({})",
            dims.iter()
                .map(|d| d.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ),
    };
    let mut header = format!(
        "{{'descr': '<f4', 'fortran_order': False, 'shape': {}, }}",
        shape_text
    );

    // Pad with spaces so data starts on an aligned offset; the header ends in '\n'.
    let unpadded = PREAMBLE_LEN + 2 + header.len() + 1;
    let padding = (HEADER_ALIGNMENT - unpadded % HEADER_ALIGNMENT) % HEADER_ALIGNMENT;
    header.extend(std::iter::repeat_n(' ', padding));
    header.push('\n');

    let mut out = Vec::with_capacity(PREAMBLE_LEN + 2 + header.len() + data.len() * 4);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&[1, 0]);
    out.extend_from_slice(&(header.len() as u16).to_le_bytes());
    out.extend_from_slice(header.as_bytes());
    for value in data {
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

fn read_len<const N: usize>(bytes: &[u8], at: usize) -> Result<usize, PayloadError> {
    let raw: [u8; N] = bytes
        .get(at..at + N)
        .and_then(|slice| slice.try_into().ok())
        .ok_or_else(|| PayloadError::InvalidNpy {
            reason: "truncated header length".to_string(),
        })?;
    Ok(raw
        .iter()
        .rev()
        .fold(0usize, |acc, &byte| (acc << 8) | byte as usize))
}

fn parse_header(text: &str) -> Result<Header, PayloadError> {
    let invalid = |reason: &str| PayloadError::InvalidNpy {
        reason: format!("{} in header {:?}", reason, text.trim()),
    };

    let descr = dict_value(text, "descr").ok_or_else(|| invalid("missing 'descr'"))?;
    let descr = descr.trim_matches(|c| c == '\'' || c == '"');
    let (endian, element) = parse_descr(descr)?;

    let fortran_order = match dict_value(text, "fortran_order") {
        Some(v) if v == "True" => true,
        Some(v) if v == "False" => false,
        _ => return Err(invalid("missing 'fortran_order'")),
    };

    let shape_text = dict_value(text, "shape").ok_or_else(|| invalid("missing 'shape'"))?;
    let inner = shape_text
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .ok_or_else(|| invalid("malformed 'shape'"))?;
    let shape = inner
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| part.trim_end_matches('L').parse::<usize>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| invalid("non-integer dimension"))?;

    Ok(Header {
        endian,
        element,
        fortran_order,
        shape,
    })
}

/// Extracts the raw text of `key`'s value from a Python dict literal.
fn dict_value<'a>(text: &'a str, key: &str) -> Option<&'a str> {
    let quoted = [format!("'{}'", key), format!("\"{}\"", key)];
    let start = quoted.iter().find_map(|q| text.find(q.as_str()).map(|i| i + q.len()))?;
    let rest = text[start..].trim_start().strip_prefix(':')?.trim_start();

    let end = if rest.starts_with('(') {
        rest.find(')')? + 1
    } else {
        rest.find([',', '}']).unwrap_or(rest.len())
    };
    Some(rest[..end].trim())
}

fn parse_descr(descr: &str) -> Result<(Endian, Element), PayloadError> {
    let (endian, kind) = match descr.split_at_checked(1) {
        Some(("<", kind)) | Some(("|", kind)) | Some(("=", kind)) => (Endian::Little, kind),
        Some((">", kind)) => (Endian::Big, kind),
        _ => (Endian::Little, descr),
    };

    let element = match kind {
        "f2" => Element::F16,
        "f4" => Element::F32,
        "f8" => Element::F64,
        other => {
            return Err(PayloadError::UnsupportedDtype {
                dtype: other.to_string(),
            });
        }
    };
    Ok((endian, element))
}

fn decode_elements(body: &[u8], element: Element, endian: Endian) -> Vec<f32> {
    let width = element.width();
    body.chunks_exact(width)
        .map(|chunk| match (element, endian) {
            (Element::F16, Endian::Little) => f16::from_le_bytes([chunk[0], chunk[1]]).to_f32(),
            (Element::F16, Endian::Big) => f16::from_be_bytes([chunk[0], chunk[1]]).to_f32(),
            (Element::F32, Endian::Little) => {
                f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])
            }
            (Element::F32, Endian::Big) => {
                f32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])
            }
            (Element::F64, endian) => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(chunk);
                let value = match endian {
                    Endian::Little => f64::from_le_bytes(raw),
                    Endian::Big => f64::from_be_bytes(raw),
                };
                value as f32
            }
        })
        .collect()
}

/// Reorders column-major `data` of `shape` into row-major order.
fn fortran_to_c_order(data: &[f32], shape: &[usize]) -> Vec<f32> {
    let ndim = shape.len();
    let mut f_strides = vec![1usize; ndim];
    for axis in 1..ndim {
        f_strides[axis] = f_strides[axis - 1] * shape[axis - 1];
    }

    let mut out = Vec::with_capacity(data.len());
    let mut index = vec![0usize; ndim];
    for _ in 0..data.len() {
        let offset: usize = index.iter().zip(&f_strides).map(|(i, s)| i * s).sum();
        out.push(data[offset]);

        for axis in (0..ndim).rev() {
            index[axis] += 1;
            if index[axis] < shape[axis] {
                break;
            }
            index[axis] = 0;
        }
    }
    out
}
