//! Deterministic synthetic CT slices with round nodules.
//!
//! Stands in for a real scan archive so the harness can run end to end. Each
//! sample id seeds its own generator, so a sample looks the same whichever
//! worker loads it and in whichever epoch.

use rand::rngs::StdRng;
use rand::{ Rng, SeedableRng };

use crate::config::{ Augmentation, SyntheticConfig };
use crate::data::{ label_code, SegSample, SegmentationDataset };
use crate::error::{ SegError, SegResult };

const HU_MIN: f32 = -1000.0;
const HU_MAX: f32 = 1000.0;
const LUNG_HU: f32 = -800.0;
const BENIGN_HU: f32 = 0.0;
const MALIGNANT_HU: f32 = 150.0;
const NODULE_FRACTION: f64 = 0.6;
const MALIGNANT_FRACTION: f64 = 0.4;
const SLICES_PER_SERIES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Training,
    Validation,
}

#[derive(Debug, Clone)]
pub struct SyntheticCtDataset {
    ids: Vec<usize>,
    size: usize,
    context_slices: usize,
    seed: u64,
    augmentation: Augmentation,
}

impl SyntheticCtDataset {
    /// Every `test_stride`-th sample id belongs to the validation split.
    /// Augmentation only applies to the training split.
    pub fn new(config: &SyntheticConfig, split: Split, augmentation: Augmentation) -> Self {
        let stride = config.test_stride.max(1);
        let ids = (0..config.samples)
            .filter(|id| (id % stride == 0) == (split == Split::Validation))
            .collect();

        SyntheticCtDataset {
            ids,
            size: config.image_size,
            context_slices: config.context_slices,
            seed: config.seed,
            augmentation: match split {
                Split::Training => augmentation,
                Split::Validation => Augmentation::default(),
            },
        }
    }

    pub fn channels(&self) -> usize {
        self.context_slices * 2 + 1
    }

    fn id(&self, ndx: usize) -> SegResult<usize> {
        self.ids
            .get(ndx)
            .copied()
            .ok_or_else(|| SegError::Dataset(format!("sample {ndx} out of range ({})", self.ids.len())))
    }

    fn generate(&self, id: usize, augment_sample: bool) -> SegSample {
        let mut rng = StdRng::seed_from_u64(self.seed ^ (id as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15));
        let size = self.size;
        let plane = size * size;
        let channels = self.channels();

        let mut ct: Vec<f32> = (0..channels * plane)
            .map(|_| LUNG_HU + rng.gen_range(-60.0..60.0))
            .collect();
        let mut nodule = vec![0.0; plane];

        let has_nodule = rng.gen_bool(NODULE_FRACTION);
        let is_malignant = has_nodule && rng.gen_bool(MALIGNANT_FRACTION);

        if has_nodule {
            let max_radius = ((size as f32) / 8.0).max(2.0);
            let radius = rng.gen_range(1.5..=max_radius) * (if is_malignant { 1.3 } else { 1.0 });
            let margin = radius.ceil() as usize + 1;
            let (cx, cy) = if size > 2 * margin {
                (rng.gen_range(margin..size - margin) as f32, rng.gen_range(margin..size - margin) as f32)
            } else {
                ((size as f32) / 2.0, (size as f32) / 2.0)
            };
            let intensity = if is_malignant { MALIGNANT_HU } else { BENIGN_HU };

            for channel in 0..channels {
                let offset = (channel as f32) - (self.context_slices as f32);
                let falloff = 1.0 - (offset / ((self.context_slices as f32) + 1.0)).powi(2);
                let slice_radius = radius * falloff.max(0.0).sqrt();
                let slice = &mut ct[channel * plane..(channel + 1) * plane];
                let center = channel == self.context_slices;

                for y in 0..size {
                    for x in 0..size {
                        let (dx, dy) = ((x as f32) - cx, (y as f32) - cy);
                        if dx * dx + dy * dy <= slice_radius * slice_radius {
                            slice[y * size + x] = intensity + rng.gen_range(-20.0..20.0);
                            if center {
                                nodule[y * size + x] = 1.0;
                            }
                        }
                    }
                }
            }
        }

        let (benign, malignant) = if is_malignant {
            (vec![0.0; plane], nodule.clone())
        } else {
            (nodule.clone(), vec![0.0; plane])
        };

        let mut sample = SegSample {
            ct,
            channels,
            height: size,
            width: size,
            nodule,
            benign,
            malignant,
            label: label_code(has_nodule, is_malignant),
            series_uid: format!("1.3.6.1.4.1.synthetic.{}", id / SLICES_PER_SERIES),
            slice_ndx: id % SLICES_PER_SERIES,
        };

        if augment_sample && self.augmentation.is_enabled() {
            augment(&mut sample, &self.augmentation, &mut rand::thread_rng());
        }
        for value in sample.ct.iter_mut() {
            *value = value.clamp(HU_MIN, HU_MAX);
        }

        sample
    }
}

impl SegmentationDataset for SyntheticCtDataset {
    fn len(&self) -> usize {
        self.ids.len()
    }

    fn get(&self, ndx: usize) -> SegResult<SegSample> {
        Ok(self.generate(self.id(ndx)?, true))
    }

    fn get_preview(&self, ndx: usize) -> SegResult<SegSample> {
        Ok(self.generate(self.id(ndx)?, false))
    }
}

fn augment<R: Rng>(sample: &mut SegSample, augmentation: &Augmentation, rng: &mut R) {
    let flip = augmentation.flip && rng.gen_bool(0.5);
    let quarter_turns = if augmentation.rotate { rng.gen_range(0..4) } else { 0 };

    if flip || quarter_turns > 0 {
        let size = sample.width;
        let plane = size * size;
        let mut ct = Vec::with_capacity(sample.ct.len());
        for channel in sample.ct.chunks(plane) {
            ct.extend(transform_plane(channel, size, flip, quarter_turns));
        }
        sample.ct = ct;
        sample.nodule = transform_plane(&sample.nodule, size, flip, quarter_turns);
        sample.benign = transform_plane(&sample.benign, size, flip, quarter_turns);
        sample.malignant = transform_plane(&sample.malignant, size, flip, quarter_turns);
    }

    if let Some(noise) = augmentation.noise {
        for value in sample.ct.iter_mut() {
            *value += rng.gen_range(-1.0..1.0) * noise;
        }
    }
}

/// Mirrors a square plane left-right, then rotates it by quarter turns.
fn transform_plane(plane: &[f32], size: usize, flip: bool, quarter_turns: u8) -> Vec<f32> {
    let mut out = vec![0.0; plane.len()];
    for y in 0..size {
        for x in 0..size {
            let sx = if flip { size - 1 - x } else { x };
            let (ty, tx) = match quarter_turns % 4 {
                0 => (y, sx),
                1 => (sx, size - 1 - y),
                2 => (size - 1 - y, size - 1 - sx),
                _ => (size - 1 - sx, y),
            };
            out[ty * size + tx] = plane[y * size + x];
        }
    }
    out
}
