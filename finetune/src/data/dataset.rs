use std::{
    fs,
    path::{Path, PathBuf},
};

use machine_learning::{arch::loss::TaskMode, mixup::VolumeShape};
use rand::rngs::StdRng;

use super::augment::Transform;
use crate::{FinetuneErr, Result};

const NPY_MAGIC: &[u8] = b"\x93NUMPY";

/// One `(volume, label)` pair.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// `channels × side³` values in `[c, z, y, x]` order.
    pub volume: Vec<f32>,
    pub label: Vec<f32>,
}

/// A manifest row.
#[derive(Debug, Clone, PartialEq)]
struct Entry {
    path: PathBuf,
    label: Vec<f32>,
}

/// Volumes listed in a CSV manifest, read from disk on demand.
///
/// Every row is `path,label[,label...]`, fields may be quoted. The first row
/// is taken as a header when its labels are not numbers. Relative paths are
/// resolved against the manifest's directory.
pub struct VolumeDataset {
    entries: Vec<Entry>,
    volume: VolumeShape,
    transform: Option<Box<dyn Transform>>,
}

impl VolumeDataset {
    /// Reads and validates a manifest.
    ///
    /// # Arguments
    /// * `manifest` - The CSV file.
    /// * `volume` - The layout every volume must have.
    /// * `task` - How labels are interpreted.
    /// * `nb_classes` - The amount of classes or outputs.
    pub fn from_manifest(
        manifest: &Path,
        volume: VolumeShape,
        task: TaskMode,
        nb_classes: usize,
    ) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .trim(csv::Trim::All)
            .flexible(true)
            .from_path(manifest)
            .map_err(|e| FinetuneErr::dataset(manifest, e.to_string()))?;
        let root = manifest.parent().unwrap_or(Path::new("."));

        let mut entries = Vec::new();
        for (row, record) in reader.records().enumerate() {
            let record = record.map_err(|e| FinetuneErr::dataset(manifest, e.to_string()))?;
            let line = record.position().map_or(row as u64 + 1, |p| p.line());

            let Some(path) = record.get(0).filter(|p| !p.is_empty()) else {
                continue;
            };

            let label = match record
                .iter()
                .skip(1)
                .map(str::parse::<f32>)
                .collect::<std::result::Result<Vec<_>, _>>()
            {
                Ok(label) => label,
                // A first row with non numeric labels is the header.
                Err(_) if row == 0 => continue,
                Err(e) => {
                    return Err(FinetuneErr::dataset(manifest, format!("line {line}: {e}")));
                }
            };

            check_label(&label, task, nb_classes)
                .map_err(|msg| FinetuneErr::dataset(manifest, format!("line {line}: {msg}")))?;

            entries.push(Entry {
                path: root.join(path),
                label,
            });
        }

        if entries.is_empty() {
            return Err(FinetuneErr::dataset(manifest, "the manifest lists no volumes"));
        }

        Ok(Self {
            entries,
            volume,
            transform: None,
        })
    }

    /// Applies `transform` to every volume read from now on.
    pub fn with_transform(mut self, transform: Box<dyn Transform>) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn volume(&self) -> VolumeShape {
        self.volume
    }

    /// Reads the `idx`th volume and runs the transform on it.
    pub fn get(&self, idx: usize, rng: &mut StdRng) -> Result<Sample> {
        let entry = self.entries.get(idx).ok_or_else(|| {
            FinetuneErr::InvalidConfig(format!("sample {idx} out of {} requested", self.len()))
        })?;

        let mut volume = read_volume(&entry.path)?;
        if volume.len() != self.volume.len() {
            return Err(FinetuneErr::dataset(
                &entry.path,
                format!(
                    "expected {} values ({} channels of {}³) but got {}",
                    self.volume.len(),
                    self.volume.channels,
                    self.volume.side,
                    volume.len()
                ),
            ));
        }

        if let Some(transform) = &self.transform {
            transform.apply(&mut volume, self.volume, rng);
        }

        Ok(Sample {
            volume,
            label: entry.label.clone(),
        })
    }
}

fn check_label(label: &[f32], task: TaskMode, nb_classes: usize) -> std::result::Result<(), String> {
    match task {
        TaskMode::MultiClass => match label {
            &[class] if class >= 0.0 && class.fract() == 0.0 && (class as usize) < nb_classes => {
                Ok(())
            }
            _ => Err(format!("expected one class index below {nb_classes}, got {label:?}")),
        },
        TaskMode::Binary => {
            if label.len() != nb_classes {
                return Err(format!("expected {nb_classes} indicators, got {label:?}"));
            }
            if label.iter().any(|&v| v != 0.0 && v != 1.0) {
                return Err(format!("binary indicators must be 0 or 1, got {label:?}"));
            }
            Ok(())
        }
        TaskMode::Regression if label.len() != nb_classes => {
            Err(format!("expected {nb_classes} targets, got {label:?}"))
        }
        TaskMode::Regression => Ok(()),
    }
}

/// Reads a `.npy` (`<f4`, C order) or a raw little-endian `f32` volume.
pub fn read_volume(path: &Path) -> Result<Vec<f32>> {
    let bytes = fs::read(path).map_err(|e| FinetuneErr::dataset(path, e.to_string()))?;

    let payload = if path.extension().is_some_and(|ext| ext == "npy") {
        npy_payload(&bytes).map_err(|msg| FinetuneErr::dataset(path, msg))?
    } else {
        &bytes[..]
    };

    if payload.len() % 4 != 0 {
        return Err(FinetuneErr::dataset(
            path,
            format!("{} bytes is not a whole amount of f32 values", payload.len()),
        ));
    }

    Ok(payload
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

/// Validates a `.npy` header and returns the array bytes.
fn npy_payload(bytes: &[u8]) -> std::result::Result<&[u8], String> {
    let rest = bytes
        .strip_prefix(NPY_MAGIC)
        .ok_or("missing the npy magic string")?;

    let (header_len, rest) = match rest {
        [1, _, a, b, rest @ ..] => (u16::from_le_bytes([*a, *b]) as usize, rest),
        [2 | 3, _, a, b, c, d, rest @ ..] => (u32::from_le_bytes([*a, *b, *c, *d]) as usize, rest),
        _ => return Err("unsupported npy version".into()),
    };

    if rest.len() < header_len {
        return Err("truncated npy header".into());
    }

    let (header, data) = rest.split_at(header_len);
    let header = String::from_utf8_lossy(header);

    if !header.contains("'descr': '<f4'") {
        return Err(format!("only little-endian float32 arrays are supported, header {header}"));
    }
    if header.contains("'fortran_order': True") {
        return Err("fortran ordered arrays are not supported".into());
    }

    Ok(data)
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use tempfile::tempdir;

    use super::*;

    fn npy(values: &[f32], descr: &str, shape: &str) -> Vec<u8> {
        let mut header =
            format!("{{'descr': '{descr}', 'fortran_order': False, 'shape': {shape}, }}");
        while (NPY_MAGIC.len() + 4 + header.len() + 1) % 64 != 0 {
            header.push(' ');
        }
        header.push('\n');

        let mut out = NPY_MAGIC.to_vec();
        out.extend_from_slice(&[1, 0]);
        out.extend_from_slice(&(header.len() as u16).to_le_bytes());
        out.extend_from_slice(header.as_bytes());
        out.extend(values.iter().flat_map(|v| v.to_le_bytes()));
        out
    }

    const CUBE: VolumeShape = VolumeShape {
        channels: 1,
        side: 2,
    };

    #[test]
    fn reads_npy_and_raw_volumes() {
        let dir = tempdir().unwrap();
        let values: Vec<f32> = (0..8).map(|i| i as f32 * 0.5).collect();

        fs::write(dir.path().join("a.npy"), npy(&values, "<f4", "(2, 2, 2)")).unwrap();
        fs::write(
            dir.path().join("b.raw"),
            values.iter().flat_map(|v| v.to_le_bytes()).collect::<Vec<_>>(),
        )
        .unwrap();
        fs::write(dir.path().join("list.csv"), "path,label\na.npy,1\nb.raw,0\n").unwrap();

        let ds = VolumeDataset::from_manifest(&dir.path().join("list.csv"), CUBE, TaskMode::Binary, 1)
            .unwrap();
        let mut rng = StdRng::seed_from_u64(0);

        assert_eq!(ds.len(), 2);
        let a = ds.get(0, &mut rng).unwrap();
        let b = ds.get(1, &mut rng).unwrap();
        assert_eq!(a.volume, values);
        assert_eq!(a.label, vec![1.0]);
        assert_eq!(b.volume, values);
        assert_eq!(b.label, vec![0.0]);
    }

    #[test]
    fn rejects_wrong_volume_sizes() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.raw"), [0u8; 12]).unwrap();
        fs::write(dir.path().join("list.csv"), "a.raw,0\n").unwrap();

        let ds = VolumeDataset::from_manifest(&dir.path().join("list.csv"), CUBE, TaskMode::Binary, 1)
            .unwrap();
        assert!(matches!(
            ds.get(0, &mut StdRng::seed_from_u64(0)),
            Err(FinetuneErr::Dataset { .. })
        ));
    }

    #[test]
    fn labels_are_validated_per_task() {
        assert!(check_label(&[2.0], TaskMode::MultiClass, 3).is_ok());
        assert!(check_label(&[3.0], TaskMode::MultiClass, 3).is_err());
        assert!(check_label(&[1.5], TaskMode::MultiClass, 3).is_err());
        assert!(check_label(&[1.0, 0.0], TaskMode::Binary, 2).is_ok());
        assert!(check_label(&[0.5], TaskMode::Binary, 1).is_err());
        assert!(check_label(&[0.3, -2.0], TaskMode::Regression, 2).is_ok());
        assert!(check_label(&[0.3], TaskMode::Regression, 2).is_err());
    }

    #[test]
    fn missing_manifest_is_a_dataset_error() {
        let err = VolumeDataset::from_manifest(
            Path::new("/definitely/not/here.csv"),
            CUBE,
            TaskMode::Binary,
            1,
        );
        assert!(matches!(err, Err(FinetuneErr::Dataset { .. })));
    }

    #[test]
    fn any_non_numeric_first_row_is_a_header() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("list.csv"), "image,label
a.raw,1
b.raw,0
").unwrap();

        let ds = VolumeDataset::from_manifest(&dir.path().join("list.csv"), CUBE, TaskMode::Binary, 1)
            .unwrap();
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.entries[0].path, dir.path().join("a.raw"));
    }

    #[test]
    fn quoted_fields_are_unescaped() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("list.csv"),
            "\"path\",\"label\"\n\"scan, left.raw\", 2\nb.raw,0\n",
        )
        .unwrap();

        let ds =
            VolumeDataset::from_manifest(&dir.path().join("list.csv"), CUBE, TaskMode::MultiClass, 3)
                .unwrap();
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.entries[0].path, dir.path().join("scan, left.raw"));
        assert_eq!(ds.entries[0].label, vec![2.0]);
    }

    #[test]
    fn bad_labels_after_the_first_row_are_errors() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("list.csv"), "a.raw,1
b.raw,yes
").unwrap();

        let err = VolumeDataset::from_manifest(&dir.path().join("list.csv"), CUBE, TaskMode::Binary, 1);
        assert!(matches!(err, Err(FinetuneErr::Dataset { msg, .. }) if msg.starts_with("line 2")));
    }

    #[test]
    fn bad_npy_dtype_is_rejected() {
        assert!(npy_payload(&npy(&[0.0], "<f4", "(1,)")).is_ok());
        assert!(npy_payload(&npy(&[0.0], "<f8", "(1,)")).is_err());
        assert!(npy_payload(b"not an npy file").is_err());
    }
}
