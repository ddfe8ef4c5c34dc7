//! Random flips and small rotations of raw view images during stage 1.

use crate::config::AugmentationConfig;
use ndarray::{Array2, Axis};
use rand::Rng;

#[derive(Debug, Clone)]
pub struct Augmenter {
    config: AugmentationConfig,
}

impl Augmenter {
    pub fn new(config: &AugmentationConfig) -> Self {
        Self { config: config.clone() }
    }

    pub fn apply<R: Rng + ?Sized>(&self, image: &Array2<f64>, rng: &mut R) -> Array2<f64> {
        let mut out = image.clone();
        if rng.gen_bool(self.config.horizontal_flip_probability.clamp(0.0, 1.0)) {
            out.invert_axis(Axis(1));
        }
        if rng.gen_bool(self.config.vertical_flip_probability.clamp(0.0, 1.0)) {
            out.invert_axis(Axis(0));
        }
        let max = self.config.max_rotation_degrees.abs();
        if max > 0.0 {
            let degrees = rng.gen_range(-max..=max);
            out = rotate(&out, degrees);
        }
        out.as_standard_layout().into_owned()
    }
}

/// Nearest-neighbour rotation about the image centre. Pixels that map from outside
/// the source are filled with zero, the background value of raw mammograms.
pub fn rotate(image: &Array2<f64>, degrees: f64) -> Array2<f64> {
    let (height, width) = image.dim();
    let (sin, cos) = degrees.to_radians().sin_cos();
    let cy = (height as f64 - 1.0) / 2.0;
    let cx = (width as f64 - 1.0) / 2.0;
    Array2::from_shape_fn((height, width), |(y, x)| {
        let dy = y as f64 - cy;
        let dx = x as f64 - cx;
        // Inverse mapping: rotate the destination coordinate back into the source.
        let sy = (cos * dy - sin * dx + cy).round();
        let sx = (sin * dy + cos * dx + cx).round();
        if sy >= 0.0 && sx >= 0.0 && (sy as usize) < height && (sx as usize) < width {
            image[[sy as usize, sx as usize]]
        } else {
            0.0
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn zero_rotation_is_identity() {
        let image = Array2::from_shape_fn((5, 4), |(y, x)| (y * 4 + x) as f64);
        assert_eq!(rotate(&image, 0.0), image);
    }

    #[test]
    fn quarter_turn_of_a_square_moves_corners() {
        let image = array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0], [7.0, 8.0, 9.0]];
        let turned = rotate(&image, 90.0);
        assert_eq!(turned[[1, 1]], 5.0);
        let mut corners = vec![turned[[0, 0]], turned[[0, 2]], turned[[2, 0]], turned[[2, 2]]];
        corners.sort_by(f64::total_cmp);
        assert_eq!(corners, vec![1.0, 3.0, 7.0, 9.0]);
        assert_ne!(turned, image);
    }

    #[test]
    fn certain_horizontal_flip_mirrors_columns() {
        let config = AugmentationConfig {
            horizontal_flip_probability: 1.0,
            vertical_flip_probability: 0.0,
            max_rotation_degrees: 0.0,
        };
        let image = array![[1.0, 2.0], [3.0, 4.0]];
        let mut rng = StdRng::seed_from_u64(3);
        let flipped = Augmenter::new(&config).apply(&image, &mut rng);
        assert_eq!(flipped, array![[2.0, 1.0], [4.0, 3.0]]);
    }

    #[test]
    fn augmentation_keeps_the_shape() {
        let image = Array2::from_elem((7, 5), 3.0);
        let mut rng = StdRng::seed_from_u64(11);
        let augmenter = Augmenter::new(&AugmentationConfig::default());
        for _ in 0..10 {
            assert_eq!(augmenter.apply(&image, &mut rng).dim(), (7, 5));
        }
    }
}
