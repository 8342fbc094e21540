use std::path::Path;
use std::{fs, io::Cursor};

use anyhow::{bail, Context, Result};
use dicom_object::{from_reader, open_file, DefaultDicomObject, ReadError};
use dicom_pixeldata::{ConvertOptions, ModalityLutOption, PixelDecoder};
use ndarray::Array2;

use crate::error::ViewerError;
use crate::view::SliceSource;

/// Linear calibration from stored values to physical units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rescale {
    pub slope: f64,
    pub intercept: f64,
}

impl Rescale {
    pub fn apply(&self, stored: f32) -> f32 {
        (f64::from(stored) * self.slope + self.intercept) as f32
    }
}

#[derive(Debug, Clone)]
pub struct DicomSlice {
    pub width: usize,
    pub height: usize,
    pub pixels: Array2<f32>,
    pub rescale: Option<Rescale>,
}

/// Reads single-frame monochrome slices from disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct DicomSource;

impl SliceSource for DicomSource {
    fn read_slice(&self, path: &Path) -> crate::error::Result<Array2<f32>> {
        load_slice(path)
            .map(|slice| slice.pixels)
            .map_err(|err| ViewerError::decode(path, err))
    }
}

pub fn load_slice(path: &Path) -> Result<DicomSlice> {
    let obj = open_dicom_object(path)?;

    let width: usize = obj
        .element_by_name("Columns")
        .context("Missing Columns tag")?
        .to_int()
        .context("Invalid Columns value")?;
    let height: usize = obj
        .element_by_name("Rows")
        .context("Missing Rows tag")?
        .to_int()
        .context("Invalid Rows value")?;

    let decoded = obj
        .decode_pixel_data_frame(0)
        .context("Failed to decode PixelData frame 0")?;

    let decoded_width = decoded.columns() as usize;
    let decoded_height = decoded.rows() as usize;
    if decoded_width != width || decoded_height != height {
        bail!(
            "Decoded frame dimensions mismatch: decoded={}x{}, tags={}x{}",
            decoded_width,
            decoded_height,
            width,
            height
        );
    }

    if decoded.samples_per_pixel() != 1 {
        bail!(
            "Unsupported SamplesPerPixel={} (only monochrome slices can be viewed)",
            decoded.samples_per_pixel()
        );
    }
    let bits_allocated = decoded.bits_allocated();
    if bits_allocated != 8 && bits_allocated != 16 {
        bail!("BitsAllocated={} is not supported (only 8/16)", bits_allocated);
    }

    // Stored values only; calibration is applied below when both constants exist.
    let options = ConvertOptions::new().with_modality_lut(ModalityLutOption::None);
    let stored: Vec<f32> = decoded
        .to_vec_frame_with_options(0, &options)
        .context("Could not convert decoded frame 0 to f32 samples")?;
    if stored.len() != width * height {
        bail!(
            "Decoded pixel count mismatch in frame 0: got {}, expected {}",
            stored.len(),
            width * height
        );
    }

    let rescale = read_rescale(&obj);
    let values = match rescale {
        Some(rescale) => stored.into_iter().map(|value| rescale.apply(value)).collect(),
        None => stored,
    };
    let pixels = Array2::from_shape_vec((height, width), values)
        .context("Pixel buffer does not match Rows x Columns")?;

    let slice = DicomSlice {
        width,
        height,
        pixels,
        rescale,
    };
    log::debug!(
        "Loaded {} ({}x{}, rescale={:?})",
        path.display(),
        slice.width,
        slice.height,
        slice.rescale
    );
    Ok(slice)
}

fn read_rescale(obj: &DefaultDicomObject) -> Option<Rescale> {
    let slope = read_float_first(obj, "RescaleSlope")?;
    let intercept = read_float_first(obj, "RescaleIntercept")?;
    Some(Rescale { slope, intercept })
}

fn open_dicom_object(path: &Path) -> Result<DefaultDicomObject> {
    match open_file(path) {
        Ok(obj) => Ok(obj),
        Err(err) if is_missing_meta_group_length_error(&err) => {
            let bytes =
                fs::read(path).with_context(|| format!("Could not read {}", path.display()))?;
            let Some(repaired) = insert_meta_group_length(&bytes) else {
                return Err(err).with_context(|| format!("Could not open {}", path.display()));
            };
            log::warn!(
                "{} lacks File Meta Information Group Length, repaired in memory",
                path.display()
            );
            from_reader(Cursor::new(repaired)).with_context(|| {
                format!(
                    "Could not open {} after repairing File Meta Information Group Length (0002,0000)",
                    path.display()
                )
            })
        }
        Err(err) => Err(err).with_context(|| format!("Could not open {}", path.display())),
    }
}

fn is_missing_meta_group_length_error(error: &ReadError) -> bool {
    matches!(
        error,
        ReadError::ParseMetaDataSet {
            source: dicom_object::meta::Error::UnexpectedTag { tag, .. }
        } if tag.group() == 0x0002 && tag.element() != 0x0000
    )
}

/// VRs whose explicit little-endian header carries a 32-bit length.
const LONG_VRS: [&[u8]; 10] = [
    b"OB", b"OD", b"OF", b"OL", b"OW", b"SQ", b"UC", b"UR", b"UT", b"UN",
];

/// Tag and encoded size of one File Meta element.
struct MetaElement {
    group: u16,
    element: u16,
    encoded_len: usize,
}

impl MetaElement {
    /// Reads the header at `at`. File Meta is always explicit VR little endian.
    fn read(bytes: &[u8], at: usize) -> Option<Self> {
        let header = bytes.get(at..at.checked_add(8)?)?;
        let word = |offset: usize| u16::from_le_bytes([header[offset], header[offset + 1]]);
        let encoded_len = if LONG_VRS.contains(&&header[4..6]) {
            let raw = bytes.get(at + 8..at + 12)?;
            let value_len = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
            if value_len == u32::MAX {
                return None;
            }
            12 + usize::try_from(value_len).ok()?
        } else {
            8 + usize::from(word(6))
        };
        Some(Self {
            group: word(0),
            element: word(2),
            encoded_len,
        })
    }
}

/// Rebuilds a file whose meta group starts without (0002,0000) by inserting
/// a UL group length in front of it. Returns `None` when nothing needs fixing
/// or the meta group cannot be walked.
fn insert_meta_group_length(bytes: &[u8]) -> Option<Vec<u8>> {
    let start = meta_start(bytes)?;
    let first = MetaElement::read(bytes, start)?;
    if first.group != 0x0002 || first.element == 0x0000 {
        return None;
    }
    let group_len = meta_group_len(bytes, start)?;

    let mut element = Vec::with_capacity(12);
    element.extend_from_slice(&0x0002u16.to_le_bytes());
    element.extend_from_slice(&0x0000u16.to_le_bytes());
    element.extend_from_slice(b"UL");
    element.extend_from_slice(&4u16.to_le_bytes());
    element.extend_from_slice(&group_len.to_le_bytes());

    let mut repaired = bytes.to_vec();
    repaired.splice(start..start, element);
    Some(repaired)
}

fn meta_start(bytes: &[u8]) -> Option<usize> {
    if bytes.get(128..132) == Some(b"DICM".as_slice()) {
        Some(132)
    } else if bytes.get(..4) == Some(b"DICM".as_slice()) {
        Some(4)
    } else {
        None
    }
}

/// Encoded size of the run of group 0002 elements starting at `start`.
fn meta_group_len(bytes: &[u8], start: usize) -> Option<u32> {
    let mut end = start;
    while bytes.get(end..end + 2) == Some([0x02, 0x00].as_slice()) {
        let element = MetaElement::read(bytes, end)?;
        end = end
            .checked_add(element.encoded_len)
            .filter(|&next| next <= bytes.len())?;
    }
    u32::try_from(end - start).ok().filter(|&len| len > 0)
}

fn read_float_first(obj: &DefaultDicomObject, name: &str) -> Option<f64> {
    obj.element_by_name(name)
        .ok()
        .and_then(|el| el.to_str().ok())
        .and_then(|value| value.split('\\').next()?.trim().parse::<f64>().ok())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use dicom_core::{DataElement, PrimitiveValue, Tag, VR};
    use dicom_object::{FileDicomObject, FileMetaTableBuilder};
    use std::path::PathBuf;

    /// Write a 16-bit monochrome slice; `rescale` is (slope, intercept) and
    /// either may be omitted.
    pub(crate) fn write_test_slice(
        path: &Path,
        rows: u16,
        columns: u16,
        stored: &[u16],
        rescale: (Option<&str>, Option<&str>),
    ) {
        let meta = FileMetaTableBuilder::new()
            .transfer_syntax("1.2.840.10008.1.2.1")
            .media_storage_sop_class_uid("1.2.840.10008.5.1.4.1.1.2")
            .media_storage_sop_instance_uid("1.2.826.0.1.3680043.2.1125.1")
            .build()
            .expect("meta table should build");
        let mut obj: DefaultDicomObject = FileDicomObject::new_empty_with_meta(meta);

        let text = |tag: Tag, vr: VR, value: &str| {
            DataElement::new(tag, vr, PrimitiveValue::from(value))
        };
        let short = |tag: Tag, value: u16| DataElement::new(tag, VR::US, PrimitiveValue::from(value));

        obj.put(text(Tag(0x0008, 0x0016), VR::UI, "1.2.840.10008.5.1.4.1.1.2"));
        obj.put(text(Tag(0x0008, 0x0018), VR::UI, "1.2.826.0.1.3680043.2.1125.1"));
        obj.put(short(Tag(0x0028, 0x0002), 1));
        obj.put(text(Tag(0x0028, 0x0004), VR::CS, "MONOCHROME2"));
        obj.put(short(Tag(0x0028, 0x0010), rows));
        obj.put(short(Tag(0x0028, 0x0011), columns));
        obj.put(short(Tag(0x0028, 0x0100), 16));
        obj.put(short(Tag(0x0028, 0x0101), 16));
        obj.put(short(Tag(0x0028, 0x0102), 15));
        obj.put(short(Tag(0x0028, 0x0103), 0));
        if let Some(intercept) = rescale.1 {
            obj.put(text(Tag(0x0028, 0x1052), VR::DS, intercept));
        }
        if let Some(slope) = rescale.0 {
            obj.put(text(Tag(0x0028, 0x1053), VR::DS, slope));
        }
        obj.put(DataElement::new(
            Tag(0x7FE0, 0x0010),
            VR::OW,
            PrimitiveValue::U16(stored.to_vec().into()),
        ));

        obj.write_to_file(path).expect("test slice should be written");
    }

    pub(crate) fn temp_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "lungview-{tag}-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos()
        ))
    }

    #[test]
    fn rescale_applied_when_both_constants_present() {
        let path = temp_path("rescaled.dcm");
        write_test_slice(&path, 2, 3, &[0, 1, 2, 3, 4, 1000], (Some("2"), Some("-1024")));

        let slice = load_slice(&path).expect("slice should load");
        assert_eq!((slice.width, slice.height), (3, 2));
        assert_eq!(
            slice.rescale,
            Some(Rescale {
                slope: 2.0,
                intercept: -1024.0
            })
        );
        assert_eq!(slice.pixels[[0, 0]], -1024.0);
        assert_eq!(slice.pixels[[0, 2]], -1020.0);
        assert_eq!(slice.pixels[[1, 2]], 976.0);

        let _ = fs::remove_file(path);
    }

    #[test]
    fn raw_values_kept_when_a_constant_is_missing() {
        let path = temp_path("raw.dcm");
        write_test_slice(&path, 2, 2, &[10, 20, 30, 40], (Some("2"), None));

        let slice = load_slice(&path).expect("slice should load");
        assert!(slice.rescale.is_none());
        assert_eq!(
            slice.pixels.iter().copied().collect::<Vec<_>>(),
            [10.0, 20.0, 30.0, 40.0]
        );

        let _ = fs::remove_file(path);
    }

    #[test]
    fn garbage_file_is_a_decode_error() {
        let path = temp_path("garbage.dcm");
        fs::write(&path, b"definitely not a dicom file").expect("should write temp file");

        let err = DicomSource.read_slice(&path).unwrap_err();
        assert!(matches!(err, ViewerError::Decode { .. }));

        let _ = fs::remove_file(path);
    }

    #[test]
    fn group_length_inserted_when_missing() {
        let mut bytes = vec![0u8; 128];
        bytes.extend_from_slice(b"DICM");
        // (0002,0002) UI "ABCD"
        bytes.extend_from_slice(&[
            0x02, 0x00, 0x02, 0x00, b'U', b'I', 0x04, 0x00, b'A', b'B', b'C', b'D',
        ]);
        // (0002,0010) UI "1.2.840.10008.1.2.1" padded to 20 bytes
        bytes.extend_from_slice(&[0x02, 0x00, 0x10, 0x00, b'U', b'I', 0x14, 0x00]);
        bytes.extend_from_slice(b"1.2.840.10008.1.2.1\0");
        // first data set element ends the meta group
        bytes.extend_from_slice(&[0x08, 0x00, 0x16, 0x00, b'U', b'I', 0x02, 0x00, b'1', 0x00]);

        let repaired = insert_meta_group_length(&bytes).expect("expected repaired bytes");
        assert_eq!(&repaired[132..136], &[0x02, 0x00, 0x00, 0x00]);
        assert_eq!(&repaired[136..138], b"UL");
        assert_eq!(&repaired[140..144], &40u32.to_le_bytes());
        assert_eq!(repaired.len(), bytes.len() + 12);
    }

    #[test]
    fn group_length_left_alone_when_present() {
        let mut bytes = vec![0u8; 128];
        bytes.extend_from_slice(b"DICM");
        bytes.extend_from_slice(&[
            0x02, 0x00, 0x00, 0x00, b'U', b'L', 0x04, 0x00, 0x08, 0x00, 0x00, 0x00,
        ]);
        assert!(insert_meta_group_length(&bytes).is_none());
        assert!(insert_meta_group_length(b"not dicom").is_none());
    }

    #[test]
    fn truncated_meta_group_is_not_repaired() {
        let mut bytes = b"DICM".to_vec();
        // (0002,0001) OB claims 64 bytes but the file ends first
        bytes.extend_from_slice(&[0x02, 0x00, 0x01, 0x00, b'O', b'B', 0x00, 0x00]);
        bytes.extend_from_slice(&64u32.to_le_bytes());
        bytes.extend_from_slice(&[0x00, 0x01]);
        assert!(insert_meta_group_length(&bytes).is_none());
    }
}
