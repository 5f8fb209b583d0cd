use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek};
use std::path::Path;

use tracing::debug;
use zip::ZipArchive;

use crate::ir::{DataType, Tensor};
use crate::loader::pickle::{self, Value};
use crate::loader::{Checkpoint, LoaderError, ModelLoader};

/// Loads checkpoints written by `torch.save` (zip container, torch >= 1.6).
pub struct PytorchLoader;

impl ModelLoader for PytorchLoader {
    fn load<P: AsRef<Path>>(path: P) -> Result<Checkpoint, LoaderError> {
        let path = path.as_ref();
        let mut file = File::open(path)?;

        let mut magic = [0u8; 2];
        let read = file.read(&mut magic)?;
        file.rewind()?;
        if read == 2 && magic[0] == 0x80 && magic[1] <= 5 {
            return Err(LoaderError::UnsupportedVersion(
                "legacy (non-zip) torch serialization is not supported".to_string(),
            ));
        }

        let mut archive = ZipArchive::new(file)
            .map_err(|e| LoaderError::InvalidFormat(e.to_string()))?;

        let mut pkl_data = Vec::new();
        let mut prefix = None;

        for i in 0..archive.len() {
            let mut entry = archive.by_index(i)
                .map_err(|e| LoaderError::InvalidFormat(e.to_string()))?;
            if let Some(stripped) = entry.name().strip_suffix("data.pkl") {
                if stripped.is_empty() || stripped.ends_with('/') {
                    prefix = Some(stripped.to_string());
                    entry.read_to_end(&mut pkl_data)?;
                    break;
                }
            }
        }

        let prefix = prefix
            .ok_or_else(|| LoaderError::InvalidFormat("data.pkl not found in archive".to_string()))?;

        if let Some(order) = read_entry(&mut archive, &format!("{}byteorder", prefix))? {
            if String::from_utf8_lossy(&order).trim() != "little" {
                return Err(LoaderError::UnsupportedVersion("big-endian tensor storage".to_string()));
            }
        }

        let decoded = pickle::from_slice(&pkl_data)?;
        let mut storages = StorageReader {
            archive: &mut archive,
            prefix,
            cache: HashMap::new(),
        };
        let root = rebuild(decoded, &mut storages)?;
        debug!(path = %path.display(), storages = storages.cache.len(), "checkpoint unpickled");

        Ok(Checkpoint { root })
    }
}

fn read_entry<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    name: &str,
) -> Result<Option<Vec<u8>>, LoaderError> {
    match archive.by_name(name) {
        Ok(mut entry) => {
            let mut buf = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut buf)?;
            Ok(Some(buf))
        }
        Err(zip::result::ZipError::FileNotFound) => Ok(None),
        Err(e) => Err(LoaderError::InvalidFormat(e.to_string())),
    }
}

struct StorageReader<'a, R: Read + Seek> {
    archive: &'a mut ZipArchive<R>,
    prefix: String,
    cache: HashMap<String, Tensor>,
}

/// Element layout of a torch storage class and the IR type it is widened to.
#[derive(Debug, Clone, Copy, PartialEq)]
enum StorageKind {
    Half,
    BFloat16,
    Float,
    Double,
    Long,
    Int,
    Byte,
    Bool,
}

impl StorageKind {
    fn from_class(name: &str) -> Option<Self> {
        Some(match name {
            "HalfStorage" => StorageKind::Half,
            "BFloat16Storage" => StorageKind::BFloat16,
            "FloatStorage" => StorageKind::Float,
            "DoubleStorage" => StorageKind::Double,
            "LongStorage" => StorageKind::Long,
            "IntStorage" => StorageKind::Int,
            "ByteStorage" | "UntypedStorage" => StorageKind::Byte,
            "BoolStorage" => StorageKind::Bool,
            _ => return None,
        })
    }

    fn element_size(&self) -> usize {
        match self {
            StorageKind::Half | StorageKind::BFloat16 => 2,
            StorageKind::Float | StorageKind::Int => 4,
            StorageKind::Double | StorageKind::Long => 8,
            StorageKind::Byte | StorageKind::Bool => 1,
        }
    }

    /// Converts raw storage bytes into IR element bytes.
    fn decode(&self, raw: &[u8]) -> (DataType, Vec<u8>) {
        match self {
            StorageKind::Half => {
                let values: Vec<f32> = raw
                    .chunks_exact(2)
                    .map(|b| half::f16::from_le_bytes([b[0], b[1]]).to_f32())
                    .collect();
                (DataType::F32, bytemuck::cast_slice(&values).to_vec())
            }
            StorageKind::BFloat16 => {
                let values: Vec<f32> = raw
                    .chunks_exact(2)
                    .map(|b| half::bf16::from_le_bytes([b[0], b[1]]).to_f32())
                    .collect();
                (DataType::F32, bytemuck::cast_slice(&values).to_vec())
            }
            StorageKind::Double => {
                let values: Vec<f32> = raw
                    .chunks_exact(8)
                    .map(|b| {
                        let mut buf = [0u8; 8];
                        buf.copy_from_slice(b);
                        f64::from_le_bytes(buf) as f32
                    })
                    .collect();
                (DataType::F32, bytemuck::cast_slice(&values).to_vec())
            }
            StorageKind::Float => (DataType::F32, raw.to_vec()),
            StorageKind::Long => (DataType::I64, raw.to_vec()),
            StorageKind::Int => (DataType::I32, raw.to_vec()),
            StorageKind::Byte => (DataType::U8, raw.to_vec()),
            StorageKind::Bool => (DataType::Bool, raw.to_vec()),
        }
    }
}

impl<'a, R: Read + Seek> StorageReader<'a, R> {
    /// Resolves `('storage', <class>, key, location, numel)` to a flat tensor.
    fn load(&mut self, pid: &Value) -> Result<Tensor, LoaderError> {
        let fields = pid
            .as_seq()
            .ok_or_else(|| LoaderError::InvalidFormat(format!("unexpected persistent id {:?}", pid)))?;
        if fields.len() < 5 || fields[0].as_str() != Some("storage") {
            return Err(LoaderError::InvalidFormat(format!("unexpected persistent id {:?}", pid)));
        }
        let class = match &fields[1] {
            Value::Global { name, .. } => name.as_str(),
            other => {
                return Err(LoaderError::InvalidFormat(format!("storage class {:?}", other)));
            }
        };
        let kind = StorageKind::from_class(class)
            .ok_or_else(|| LoaderError::InvalidFormat(format!("unsupported storage type {}", class)))?;
        let key = fields[2]
            .as_str()
            .ok_or_else(|| LoaderError::InvalidFormat("storage key is not a string".to_string()))?;

        if let Some(cached) = self.cache.get(key) {
            return Ok(cached.clone());
        }

        let entry = format!("{}data/{}", self.prefix, key);
        let raw = read_entry(self.archive, &entry)?
            .ok_or_else(|| LoaderError::InvalidFormat(format!("storage {} missing from archive", entry)))?;
        if raw.len() % kind.element_size() != 0 {
            return Err(LoaderError::InvalidFormat(format!(
                "storage {} has {} bytes, not a multiple of {}",
                key,
                raw.len(),
                kind.element_size()
            )));
        }
        let numel = raw.len() / kind.element_size();
        let (data_type, data) = kind.decode(&raw);
        let tensor = Tensor {
            name: key.to_string(),
            shape: vec![numel],
            data_type,
            data: Some(data),
        };
        self.cache.insert(key.to_string(), tensor.clone());
        Ok(tensor)
    }
}

fn usize_list(value: &Value, what: &str) -> Result<Vec<usize>, LoaderError> {
    value
        .as_seq()
        .ok_or_else(|| LoaderError::InvalidFormat(format!("tensor {} is not a tuple", what)))?
        .iter()
        .map(|v| {
            v.as_int()
                .filter(|&i| i >= 0)
                .map(|i| i as usize)
                .ok_or_else(|| LoaderError::InvalidFormat(format!("tensor {} has a bad entry", what)))
        })
        .collect()
}

/// Applies `(storage_offset, size, stride)` to a flat storage.
fn view_storage(
    storage: &Tensor,
    offset: usize,
    size: Vec<usize>,
    stride: &[usize],
) -> Result<Tensor, LoaderError> {
    if size.len() != stride.len() {
        return Err(LoaderError::InvalidFormat("tensor size and stride ranks differ".to_string()));
    }
    let elem = storage.data_type.size_of();
    let bytes = storage.data.as_deref().unwrap_or_default();
    let available = bytes.len() / elem;
    let overflow = || LoaderError::InvalidFormat("tensor view size overflows".to_string());
    let numel = size
        .iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .ok_or_else(overflow)?;

    if numel == 0 {
        return Ok(Tensor {
            name: String::new(),
            shape: size,
            data_type: storage.data_type,
            data: Some(Vec::new()),
        });
    }

    {
        let last = size
            .iter()
            .zip(stride)
            .try_fold(offset, |acc, (&d, &s)| (d - 1).checked_mul(s).and_then(|step| acc.checked_add(step)))
            .ok_or_else(overflow)?;
        if last >= available {
            return Err(LoaderError::InvalidFormat(format!(
                "tensor view reaches element {} of a {}-element storage",
                last, available
            )));
        }
    }

    let mut contiguous = vec![1usize; size.len()];
    for i in (0..size.len().saturating_sub(1)).rev() {
        contiguous[i] = contiguous[i + 1] * size[i + 1];
    }
    let is_contiguous = size
        .iter()
        .zip(stride.iter().zip(&contiguous))
        .all(|(&d, (&s, &c))| d == 1 || s == c);

    let data = if is_contiguous {
        bytes[offset * elem..(offset + numel) * elem].to_vec()
    } else {
        let mut out = Vec::with_capacity(numel * elem);
        for linear in 0..numel {
            let mut remaining = linear;
            let mut source = offset;
            for k in 0..size.len() {
                let coord = remaining / contiguous[k];
                remaining %= contiguous[k];
                source += coord * stride[k];
            }
            out.extend_from_slice(&bytes[source * elem..(source + 1) * elem]);
        }
        out
    };

    Ok(Tensor {
        name: String::new(),
        shape: size,
        data_type: storage.data_type,
        data: Some(data),
    })
}

fn rebuild_tensor(args: &[Value]) -> Result<Value, LoaderError> {
    if args.len() < 4 {
        return Err(LoaderError::InvalidFormat("_rebuild_tensor with too few arguments".to_string()));
    }
    let storage = args[0]
        .as_tensor()
        .ok_or_else(|| LoaderError::InvalidFormat("tensor storage did not resolve".to_string()))?;
    let offset = args[1]
        .as_int()
        .filter(|&i| i >= 0)
        .ok_or_else(|| LoaderError::InvalidFormat("bad storage offset".to_string()))? as usize;
    let size = usize_list(&args[2], "size")?;
    let stride = usize_list(&args[3], "stride")?;
    Ok(Value::Tensor(view_storage(storage, offset, size, &stride)?))
}

/// Replaces persistent ids and tensor rebuild calls with materialized tensors.
fn rebuild<R: Read + Seek>(value: Value, storages: &mut StorageReader<'_, R>) -> Result<Value, LoaderError> {
    Ok(match value {
        Value::PersistentId(pid) => Value::Tensor(storages.load(&pid)?),
        Value::Call { callable, args } => {
            let args = args
                .into_iter()
                .map(|a| rebuild(a, storages))
                .collect::<Result<Vec<_>, _>>()?;
            match callable.qualified_name().as_deref() {
                Some("torch._utils._rebuild_tensor_v2") | Some("torch._utils._rebuild_tensor") => {
                    rebuild_tensor(&args)?
                }
                Some("torch._utils._rebuild_parameter")
                | Some("torch._utils._rebuild_parameter_with_state") => match args.into_iter().next() {
                    Some(tensor @ Value::Tensor(_)) => tensor,
                    _ => {
                        return Err(LoaderError::InvalidFormat(
                            "parameter does not wrap a tensor".to_string(),
                        ))
                    }
                },
                _ => Value::Call { callable, args },
            }
        }
        Value::Tuple(items) => Value::Tuple(rebuild_all(items, storages)?),
        Value::List(items) => Value::List(rebuild_all(items, storages)?),
        Value::Set(items) => Value::Set(rebuild_all(items, storages)?),
        Value::Dict(items) => Value::Dict(
            items
                .into_iter()
                .map(|(k, v)| Ok((k, rebuild(v, storages)?)))
                .collect::<Result<Vec<_>, LoaderError>>()?,
        ),
        Value::Object { module, name, args, state } => Value::Object {
            module,
            name,
            args: rebuild_all(args, storages)?,
            state: Box::new(rebuild(*state, storages)?),
        },
        other => other,
    })
}

fn rebuild_all<R: Read + Seek>(
    items: Vec<Value>,
    storages: &mut StorageReader<'_, R>,
) -> Result<Vec<Value>, LoaderError> {
    items.into_iter().map(|v| rebuild(v, storages)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;
    use zip::write::FileOptions;

    fn write_archive(path: &Path, entries: &[(&str, Vec<u8>)]) {
        let file = File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = FileOptions::default().compression_method(zip::CompressionMethod::Stored);
        for (name, data) in entries {
            zip.start_file(*name, options).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap();
    }

    /// `{'w': _rebuild_tensor_v2(storage('0', HalfStorage), offset, size, stride, False, OrderedDict())}`
    fn tensor_pickle(offset: u8, size: &[u8], stride: &[u8]) -> Vec<u8> {
        let mut p = vec![0x80, 0x02, b'}', b'(', 0x8c, 1, b'w'];
        p.extend(b"ctorch._utils\n_rebuild_tensor_v2\n(");
        p.extend(b"(X\x07\x00\x00\x00storage");
        p.extend(b"ctorch\nHalfStorage\n");
        p.extend(b"X\x01\x00\x00\x000X\x03\x00\x00\x00cpuK\x06tQ");
        p.extend([b'K', offset, b'(']);
        for &s in size {
            p.extend([b'K', s]);
        }
        p.push(b't');
        p.push(b'(');
        for &s in stride {
            p.extend([b'K', s]);
        }
        p.push(b't');
        p.push(0x89);
        p.extend(b"ccollections\nOrderedDict\n)R");
        p.extend(b"tRu.");
        p
    }

    fn half_bytes(values: &[f32]) -> Vec<u8> {
        values
            .iter()
            .flat_map(|&v| half::f16::from_f32(v).to_le_bytes())
            .collect()
    }

    #[test]
    fn test_load_half_tensor_as_f32() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model.pt");
        write_archive(&path, &[
            ("model/data.pkl", tensor_pickle(0, &[2, 3], &[3, 1])),
            ("model/byteorder", b"little".to_vec()),
            ("model/data/0", half_bytes(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0])),
        ]);

        let ckpt = PytorchLoader::load(&path).unwrap();
        let w = ckpt.root.get("w").and_then(Value::as_tensor).unwrap();
        assert_eq!(w.shape, vec![2, 3]);
        assert_eq!(w.data_type, DataType::F32);
        assert_eq!(w.to_f32_vec().unwrap(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_load_strided_view() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model.pt");
        // transpose of a 2x3 storage, starting at element 0
        write_archive(&path, &[
            ("archive/data.pkl", tensor_pickle(0, &[3, 2], &[1, 3])),
            ("archive/data/0", half_bytes(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0])),
        ]);

        let ckpt = PytorchLoader::load(&path).unwrap();
        let w = ckpt.root.get("w").and_then(Value::as_tensor).unwrap();
        assert_eq!(w.shape, vec![3, 2]);
        assert_eq!(w.to_f32_vec().unwrap(), vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn test_view_past_storage_end_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model.pt");
        write_archive(&path, &[
            ("archive/data.pkl", tensor_pickle(2, &[2, 3], &[3, 1])),
            ("archive/data/0", half_bytes(&[0.0; 6])),
        ]);

        assert!(matches!(PytorchLoader::load(&path), Err(LoaderError::InvalidFormat(_))));
    }

    #[test]
    fn test_overflowing_view_is_invalid_format() {
        let storage = Tensor::from_f32("0", vec![6], &[0.0; 6]);
        let overflows = [
            (0, vec![2, usize::MAX], vec![1, 1]),
            (usize::MAX, vec![2], vec![1]),
            (0, vec![2, 2], vec![usize::MAX, 1]),
        ];
        for (offset, size, stride) in overflows {
            let result = view_storage(&storage, offset, size, &stride);
            assert!(matches!(result, Err(LoaderError::InvalidFormat(_))));
        }

        let empty = view_storage(&storage, usize::MAX, vec![0, 3], &[3, 1]).unwrap();
        assert_eq!(empty.shape, vec![0, 3]);
        assert_eq!(empty.data, Some(Vec::new()));
    }

    #[test]
    fn test_missing_data_pkl() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model.pt");
        write_archive(&path, &[("archive/version", b"3\n".to_vec())]);

        let result = PytorchLoader::load(&path);
        assert!(matches!(result, Err(LoaderError::InvalidFormat(_))));
    }

    #[test]
    fn test_legacy_format_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model.pt");
        File::create(&path).unwrap().write_all(&[0x80, 0x02, b'N', b'.']).unwrap();

        assert!(matches!(PytorchLoader::load(&path), Err(LoaderError::UnsupportedVersion(_))));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempdir().unwrap();
        let result = PytorchLoader::load(dir.path().join("absent.pt"));
        assert!(matches!(result, Err(LoaderError::Io(_))));
    }
}
