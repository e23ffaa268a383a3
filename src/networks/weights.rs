use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use tch::Tensor;
use tracing::info;

use crate::error::{Error, Result};

/// A source of pretrained parameter values, looked up by name.
pub trait WeightStore {
    fn fetch(&self, name: &str) -> Option<Tensor>;
}

impl WeightStore for HashMap<String, Tensor> {
    fn fetch(&self, name: &str) -> Option<Tensor> {
        self.get(name).map(Tensor::shallow_clone)
    }
}

/// Named tensors read once from a libtorch archive (`.ot`) or a `.safetensors` file.
#[derive(Debug)]
pub struct FileWeightStore {
    path: PathBuf,
    tensors: HashMap<String, Tensor>,
}

impl FileWeightStore {
    pub fn open(path: impl AsRef<Path>) -> Result<FileWeightStore> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(Error::MissingWeights {
                name: path.display().to_string(),
            });
        }
        let named = match path.extension().and_then(|e| e.to_str()) {
            Some("safetensors") => Tensor::read_safetensors(path)?,
            _ => Tensor::load_multi(path)?,
        };
        info!(path = %path.display(), tensors = named.len(), "loaded weight store");
        Ok(FileWeightStore {
            path: path.to_owned(),
            tensors: named.into_iter().collect(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}

impl WeightStore for FileWeightStore {
    fn fetch(&self, name: &str) -> Option<Tensor> {
        self.tensors.fetch(name)
    }
}

/// Overwrite `dst` with the stored tensor called `name`.
pub(crate) fn copy_weight(store: &impl WeightStore, name: &str, dst: &mut Tensor) -> Result<()> {
    let src = store.fetch(name).ok_or_else(|| Error::MissingWeights {
        name: name.to_owned(),
    })?;
    if src.size() != dst.size() {
        return Err(Error::WeightSize {
            name: name.to_owned(),
            expected: dst.size(),
            found: src.size(),
        });
    }
    tch::no_grad(|| dst.f_copy_(&src))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use tch::{Device, Kind};

    use super::*;

    #[test]
    fn missing_file_is_a_missing_resource() {
        let err = FileWeightStore::open("/nonexistent/vgg16.ot").unwrap_err();
        assert!(matches!(err, Error::MissingWeights { .. }), "{err}");
    }

    #[test]
    fn reads_libtorch_archives() {
        let path = std::env::temp_dir().join(format!("weights-{}.ot", std::process::id()));
        let t = Tensor::arange(6, (Kind::Float, Device::Cpu)).view([2, 3]);
        Tensor::save_multi(&[("block1_conv1.bias", &t)], &path).unwrap();

        let store = FileWeightStore::open(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(store.path(), path.as_path());
        assert_eq!(store.len(), 1);
        assert_eq!(store.fetch("block1_conv1.bias").unwrap().size(), [2, 3]);
        assert!(store.fetch("block1_conv1.weight").is_none());
    }

    #[test]
    fn copy_checks_name_and_size() {
        let mut store = HashMap::new();
        store.insert("w".to_owned(), Tensor::ones([2, 2], (Kind::Float, Device::Cpu)));
        let mut dst = Tensor::zeros([2, 2], (Kind::Float, Device::Cpu));

        copy_weight(&store, "w", &mut dst).unwrap();
        assert_eq!(dst.sum(Kind::Float).double_value(&[]), 4.0);

        assert!(matches!(
            copy_weight(&store, "missing", &mut dst),
            Err(Error::MissingWeights { .. })
        ));
        let mut wrong = Tensor::zeros([4], (Kind::Float, Device::Cpu));
        assert!(matches!(
            copy_weight(&store, "w", &mut wrong),
            Err(Error::WeightSize { .. })
        ));
    }
}
