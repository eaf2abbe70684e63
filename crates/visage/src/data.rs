//! Dataset interface and the prefetching batch loader.
//!
//! The trainer pulls [`HostBatch`]es from a [`Prefetcher`], which runs the
//! dataset on a worker thread ahead of a bounded channel. Batches cross the
//! thread boundary as plain host buffers and are turned into device tensors
//! by the consumer; the trainer blocks on the channel pop and never sees a
//! partially filled batch.

use std::thread::{self, JoinHandle};

use burn::tensor::{backend::Backend, Tensor, TensorData};
use crossbeam::channel::{bounded, Receiver};
use image::{GrayImage, RgbImage};

use crate::error::{Error, Result};

/// One dataset element.
pub struct FaceSample {
    /// RGB photo at the training resolution.
    pub image: RgbImage,
    /// Facial landmarks in NDC (`-1..=1`, Y down), when annotated.
    pub landmarks: Option<Vec<[f32; 2]>>,
    /// Face-region mask, when annotated.
    pub mask: Option<GrayImage>,
    /// Identity label, when known. Enables the identity-consistency term.
    pub identity: Option<u32>,
}

/// Pull-based source of [`FaceSample`]s.
///
/// How samples are decoded or augmented is the implementor's business; the
/// pipeline only requires that images match the configured resolution.
pub trait FaceDataset: Send {
    /// Produces the next sample, or `None` once exhausted.
    fn next_sample(&mut self) -> Option<FaceSample>;
}

/// An in-memory dataset, optionally cycling forever. Samples are yielded in
/// insertion order, which keeps training runs reproducible.
pub struct MemoryDataset {
    samples: Vec<FaceSample>,
    cycle: bool,
    next: usize,
}

impl MemoryDataset {
    pub fn new(samples: Vec<FaceSample>) -> Self {
        Self {
            samples,
            cycle: false,
            next: 0,
        }
    }

    /// Makes the dataset restart from the beginning instead of exhausting.
    pub fn cycling(mut self) -> Self {
        self.cycle = true;
        self
    }
}

impl FaceDataset for MemoryDataset {
    fn next_sample(&mut self) -> Option<FaceSample> {
        if self.next >= self.samples.len() {
            if !self.cycle || self.samples.is_empty() {
                return None;
            }
            self.next = 0;
        }
        let sample = &self.samples[self.next];
        self.next += 1;
        Some(FaceSample {
            image: sample.image.clone(),
            landmarks: sample.landmarks.clone(),
            mask: sample.mask.clone(),
            identity: sample.identity,
        })
    }
}

/// A fully assembled batch in host memory, ready to cross threads.
#[derive(Debug)]
pub struct HostBatch {
    batch: usize,
    resolution: usize,
    landmark_count: usize,
    images: Vec<f32>,
    landmarks: Option<Vec<f32>>,
    masks: Option<Vec<f32>>,
    identities: Option<Vec<u32>>,
}

impl HostBatch {
    /// Assembles samples into one batch.
    ///
    /// Optional annotations are carried only when *every* sample in the batch
    /// has them; mixed batches drop the annotation rather than inventing
    /// values. Landmark counts must agree across the batch.
    pub fn from_samples(samples: Vec<FaceSample>, resolution: usize) -> Result<Self> {
        let batch = samples.len();
        let pixels = resolution * resolution;

        let mut images = Vec::with_capacity(batch * 3 * pixels);
        let all_landmarks = samples.iter().all(|s| s.landmarks.is_some());
        let all_masks = samples.iter().all(|s| s.mask.is_some());
        let all_ids = samples.iter().all(|s| s.identity.is_some());

        let landmark_count = if all_landmarks {
            samples
                .first()
                .and_then(|s| s.landmarks.as_ref())
                .map(|l| l.len())
                .unwrap_or(0)
        } else {
            0
        };

        let mut landmarks = all_landmarks.then(|| Vec::with_capacity(batch * landmark_count * 2));
        let mut masks = all_masks.then(|| Vec::with_capacity(batch * pixels));
        let mut identities = all_ids.then(|| Vec::with_capacity(batch));

        for sample in &samples {
            let (w, h) = sample.image.dimensions();
            if w as usize != resolution || h as usize != resolution {
                return Err(Error::shape(
                    "FaceSample image",
                    [resolution, resolution],
                    [w as usize, h as usize],
                ));
            }

            // NCHW, sRGB mapped linearly to 0..=1.
            for channel in 0..3 {
                for pixel in sample.image.pixels() {
                    images.push(pixel.0[channel] as f32 / 255.0);
                }
            }

            if let (Some(out), Some(lmk)) = (&mut landmarks, &sample.landmarks) {
                if lmk.len() != landmark_count {
                    return Err(Error::shape(
                        "FaceSample landmarks",
                        [landmark_count],
                        [lmk.len()],
                    ));
                }
                for p in lmk {
                    out.extend(*p);
                }
            }
            if let (Some(out), Some(mask)) = (&mut masks, &sample.mask) {
                let (mw, mh) = mask.dimensions();
                if mw as usize != resolution || mh as usize != resolution {
                    return Err(Error::shape(
                        "FaceSample mask",
                        [resolution, resolution],
                        [mw as usize, mh as usize],
                    ));
                }
                out.extend(mask.pixels().map(|p| p.0[0] as f32 / 255.0));
            }
            if let (Some(out), Some(id)) = (&mut identities, &sample.identity) {
                out.push(*id);
            }
        }

        Ok(Self {
            batch,
            resolution,
            landmark_count,
            images,
            landmarks,
            masks,
            identities,
        })
    }

    pub fn len(&self) -> usize {
        self.batch
    }

    pub fn is_empty(&self) -> bool {
        self.batch == 0
    }

    /// Uploads the batch to a device.
    pub fn to_device<B: Backend>(&self, device: &B::Device) -> FaceBatch<B> {
        let (b, r, l) = (self.batch, self.resolution, self.landmark_count);
        FaceBatch {
            images: Tensor::from_data(
                TensorData::new(self.images.clone(), [b, 3, r, r]),
                device,
            ),
            landmarks: self.landmarks.as_ref().map(|lmk| {
                Tensor::from_data(TensorData::new(lmk.clone(), [b, l, 2]), device)
            }),
            masks: self.masks.as_ref().map(|m| {
                Tensor::from_data(TensorData::new(m.clone(), [b, 1, r, r]), device)
            }),
            identities: self.identities.clone(),
        }
    }
}

/// A batch on the compute device.
pub struct FaceBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub landmarks: Option<Tensor<B, 3>>,
    pub masks: Option<Tensor<B, 4>>,
    pub identities: Option<Vec<u32>>,
}

/// Runs a dataset on a worker thread, keeping a bounded queue of ready
/// batches ahead of the consumer.
pub struct Prefetcher {
    receiver: Option<Receiver<Result<HostBatch>>>,
    worker: Option<JoinHandle<()>>,
}

impl Prefetcher {
    /// Spawns the worker. `capacity` bounds how many batches may be queued.
    pub fn spawn<D>(mut dataset: D, batch_size: usize, resolution: usize, capacity: usize) -> Self
    where
        D: FaceDataset + 'static,
    {
        assert!(batch_size > 0, "batch size must be positive");
        let (sender, receiver) = bounded(capacity.max(1));

        let worker = thread::Builder::new()
            .name("visage-data".into())
            .spawn(move || loop {
                let mut samples = Vec::with_capacity(batch_size);
                while samples.len() < batch_size {
                    match dataset.next_sample() {
                        Some(sample) => samples.push(sample),
                        // Trailing partial batches are dropped; the consumer
                        // never blocks on an incomplete one.
                        None => return,
                    }
                }
                let batch = HostBatch::from_samples(samples, resolution);
                let failed = batch.is_err();
                if sender.send(batch).is_err() || failed {
                    return;
                }
            })
            .expect("failed to spawn data loader thread");

        Self {
            receiver: Some(receiver),
            worker: Some(worker),
        }
    }

    /// Blocks until the next batch is ready. `None` once the dataset is
    /// exhausted.
    pub fn next_batch(&mut self) -> Option<Result<HostBatch>> {
        self.receiver.as_ref()?.recv().ok()
    }
}

impl Drop for Prefetcher {
    fn drop(&mut self) {
        // Disconnect first so a worker blocked on send can exit.
        self.receiver.take();
        if let Some(worker) = self.worker.take() {
            worker.join().ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::{cpu, Cpu};

    fn sample(value: u8, identity: Option<u32>) -> FaceSample {
        FaceSample {
            image: RgbImage::from_pixel(8, 8, image::Rgb([value, value, value])),
            landmarks: Some(vec![[0.0, 0.0]; 4]),
            mask: None,
            identity,
        }
    }

    #[test]
    fn batch_assembly_and_upload() {
        let batch =
            HostBatch::from_samples(vec![sample(0, Some(1)), sample(255, Some(1))], 8).unwrap();
        assert_eq!(batch.len(), 2);

        let device_batch = batch.to_device::<Cpu>(&cpu());
        assert_eq!(device_batch.images.dims(), [2, 3, 8, 8]);
        assert_eq!(device_batch.landmarks.unwrap().dims(), [2, 4, 2]);
        assert_eq!(device_batch.identities, Some(vec![1, 1]));

        let values: Vec<f32> = device_batch.images.into_data().to_vec().unwrap();
        assert_eq!(values[0], 0.0);
        assert_eq!(*values.last().unwrap(), 1.0);
    }

    #[test]
    fn mixed_annotations_are_dropped() {
        let mut without_marks = sample(10, None);
        without_marks.landmarks = None;
        let batch = HostBatch::from_samples(vec![sample(10, Some(0)), without_marks], 8).unwrap();
        let device_batch = batch.to_device::<Cpu>(&cpu());
        assert!(device_batch.landmarks.is_none());
        assert!(device_batch.identities.is_none());
    }

    #[test]
    fn wrong_resolution_is_rejected() {
        let err = HostBatch::from_samples(vec![sample(0, None)], 16).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
    }

    #[test]
    fn prefetcher_preserves_order_and_drops_partial_tail() {
        let samples: Vec<FaceSample> = (0..5).map(|i| sample(i * 10, None)).collect();
        let mut prefetcher = Prefetcher::spawn(MemoryDataset::new(samples), 2, 8, 2);

        let first = prefetcher.next_batch().unwrap().unwrap();
        let second = prefetcher.next_batch().unwrap().unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 2);
        // 5th sample cannot fill a batch of 2.
        assert!(prefetcher.next_batch().is_none());

        let values = first.to_device::<Cpu>(&cpu());
        let data: Vec<f32> = values.images.into_data().to_vec().unwrap();
        assert_eq!(data[0], 0.0);
    }

    #[test]
    fn cycling_dataset_keeps_producing() {
        let mut dataset = MemoryDataset::new(vec![sample(1, None)]).cycling();
        for _ in 0..7 {
            assert!(dataset.next_sample().is_some());
        }
    }
}
