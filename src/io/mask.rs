use crate::combat::matrix::Matrix;
use crate::io::nifti::NiftiImage;
use crate::utils::error::{HarmonizeError, Result};
use std::path::PathBuf;

pub const MASK_FILE_NAME: &str = "thresholded_mask.nii.gz";

/// Voxels shared by the whole sample: the mean image across subjects,
/// thresholded.
#[derive(Debug, Clone)]
pub struct BrainMask {
    template: NiftiImage,
    indices: Vec<usize>,
}

fn geometry_error(path: &std::path::Path, expected: [usize; 3], found: [usize; 3]) -> HarmonizeError {
    HarmonizeError::NiftiError {
        path: path.display().to_string(),
        message: format!(
            "dimensions {:?} differ from the first image {:?}; all images must be in the same space",
            found, expected
        ),
    }
}

impl BrainMask {
    pub fn create(paths: &[PathBuf], threshold: f64) -> Result<Self> {
        let first_path = paths.first().ok_or_else(|| HarmonizeError::ValidationError {
            message: "no images to build a mask from".to_string(),
        })?;

        tracing::info!("Creating thresholded mask from {} images...", paths.len());
        let first = NiftiImage::read(first_path)?;
        let mut sum = first.data.clone();

        for path in &paths[1..] {
            let image = NiftiImage::read(path)?;
            if !image.same_geometry(&first) {
                return Err(geometry_error(path, first.dims, image.dims));
            }
            for (s, v) in sum.iter_mut().zip(&image.data) {
                *s += v;
            }
        }

        let n = paths.len() as f64;
        let indices: Vec<usize> = sum
            .iter()
            .enumerate()
            .filter(|&(_, &s)| (s / n) > threshold)
            .map(|(i, _)| i)
            .collect();

        if indices.is_empty() {
            return Err(HarmonizeError::ValidationError {
                message: format!("no voxel has a mean intensity above {}", threshold),
            });
        }

        tracing::info!(
            "Mask keeps {} of {} voxels (threshold {})",
            indices.len(),
            first.n_voxels(),
            threshold
        );

        let mut mask_data = vec![0.0; first.n_voxels()];
        for &i in &indices {
            mask_data[i] = 1.0;
        }
        let template = first.with_data(mask_data)?;

        Ok(Self { template, indices })
    }

    pub fn n_voxels(&self) -> usize {
        self.indices.len()
    }

    /// The mask as a 0/1 volume in the space of the first image.
    pub fn image(&self) -> &NiftiImage {
        &self.template
    }

    pub fn flatten(&self, image: &NiftiImage, origin: &std::path::Path) -> Result<Vec<f64>> {
        if !image.same_geometry(&self.template) {
            return Err(geometry_error(origin, self.template.dims, image.dims));
        }
        Ok(self.indices.iter().map(|&i| image.data[i]).collect())
    }

    /// Puts masked values back into `like`'s geometry; voxels outside the mask are zero.
    pub fn unflatten(&self, values: &[f64], like: &NiftiImage) -> Result<NiftiImage> {
        if values.len() != self.indices.len() {
            return Err(HarmonizeError::ProcessingError {
                message: format!(
                    "{} values for a mask of {} voxels",
                    values.len(),
                    self.indices.len()
                ),
            });
        }
        let mut data = vec![0.0; like.n_voxels()];
        for (&i, &v) in self.indices.iter().zip(values) {
            data[i] = v;
        }
        like.with_data(data)
    }

    /// Masked voxels of every image, one row per image.
    pub fn flatten_all(&self, paths: &[PathBuf]) -> Result<Matrix> {
        let mut data = Vec::with_capacity(paths.len() * self.n_voxels());
        for path in paths {
            let image = NiftiImage::read(path)?;
            data.extend(self.flatten(&image, path)?);
        }
        tracing::debug!("Flattened {} images x {} voxels", paths.len(), self.n_voxels());
        Matrix::from_vec(paths.len(), self.n_voxels(), data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::nifti::DataType;

    fn write_image(dir: &std::path::Path, name: &str, data: Vec<f64>) -> PathBuf {
        let path = dir.join(name);
        let img = NiftiImage::new_3d([2, 2, 1], [1.0, 1.0, 1.0])
            .with_data(data)
            .unwrap();
        std::fs::write(&path, img.encode(DataType::F32, true).unwrap()).unwrap();
        path
    }

    #[test]
    fn test_mask_uses_mean_intensity() {
        let dir = tempfile::tempdir().unwrap();
        let paths = vec![
            write_image(dir.path(), "sub-1.nii.gz", vec![0.0, 2.0, 1.0, 0.0]),
            write_image(dir.path(), "sub-2.nii.gz", vec![0.0, 4.0, -1.0, 3.0]),
        ];
        let mask = BrainMask::create(&paths, 0.0).unwrap();
        // voxel 2 averages to zero and is dropped
        assert_eq!(mask.n_voxels(), 2);
        assert_eq!(mask.image().data, vec![0.0, 1.0, 0.0, 1.0]);

        let flat = mask.flatten_all(&paths).unwrap();
        assert_eq!(flat.row(0), &[2.0, 0.0]);
        assert_eq!(flat.row(1), &[4.0, 3.0]);
    }

    #[test]
    fn test_unflatten_restores_layout() {
        let dir = tempfile::tempdir().unwrap();
        let paths = vec![write_image(dir.path(), "sub-1.nii.gz", vec![5.0, 0.0, 6.0, 7.0])];
        let mask = BrainMask::create(&paths, 0.0).unwrap();
        let like = NiftiImage::read(&paths[0]).unwrap();
        let restored = mask.unflatten(&[1.0, 2.0, 3.0], &like).unwrap();
        assert_eq!(restored.data, vec![1.0, 0.0, 2.0, 3.0]);
        assert!(mask.unflatten(&[1.0], &like).is_err());
    }

    #[test]
    fn test_mismatched_geometry_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let first = write_image(dir.path(), "sub-1.nii.gz", vec![1.0; 4]);
        let other = dir.path().join("sub-2.nii.gz");
        let img = NiftiImage::new_3d([4, 1, 1], [1.0, 1.0, 1.0]);
        std::fs::write(&other, img.encode(DataType::F32, true).unwrap()).unwrap();
        assert!(BrainMask::create(&[first, other], 0.0).is_err());
    }
}
