use crate::{
    config::{ModelConfig, Validatable},
    detection::Detection,
    model_service::{ModelError, ModelService},
    state::ClassLabels,
};
use async_trait::async_trait;
use image::{imageops::FilterType, RgbImage};
use ndarray::{s, Array, ArrayD, ArrayViewD, Axis, Ix4};
use ort::{
    session::{builder::GraphOptimizationLevel, Session},
    value::TensorRef,
};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

/// Raw box decoded from the model output, before labels are attached.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Candidate {
    class_id: usize,
    confidence: f32,
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
}

fn intersection(box1: &Candidate, box2: &Candidate) -> f32 {
    let width = (box1.x2.min(box2.x2) - box1.x1.max(box2.x1)).max(0.);
    let height = (box1.y2.min(box2.y2) - box1.y1.max(box2.y1)).max(0.);
    width * height
}

fn union(box1: &Candidate, box2: &Candidate) -> f32 {
    ((box1.x2 - box1.x1) * (box1.y2 - box1.y1)) + ((box2.x2 - box2.x1) * (box2.y2 - box2.y1))
        - intersection(box1, box2)
}

fn iou(box1: &Candidate, box2: &Candidate) -> f32 {
    let union = union(box1, box2);
    if union <= 0. {
        return 0.;
    }
    intersection(box1, box2) / union
}

/// Per-class non-maximum suppression, highest confidence first.
fn non_max_suppression(mut boxes: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    boxes.sort_by(|box1, box2| box2.confidence.total_cmp(&box1.confidence));
    let mut result = Vec::new();

    while let Some(&best) = boxes.first() {
        result.push(best);
        boxes = boxes
            .into_iter()
            .skip(1)
            .filter(|other| other.class_id != best.class_id || iou(&best, other) < iou_threshold)
            .collect();
    }

    result
}

fn to_input_tensor(image: &RgbImage, input_size: u32) -> Array<f32, Ix4> {
    let img = image::imageops::resize(image, input_size, input_size, FilterType::CatmullRom);
    let side = input_size as usize;

    let mut input = Array::zeros((1, 3, side, side));
    for (x, y, pixel) in img.enumerate_pixels() {
        let x = x as usize;
        let y = y as usize;
        let [r, g, b] = pixel.0;
        input[[0, 0, y, x]] = (r as f32) / 255.;
        input[[0, 1, y, x]] = (g as f32) / 255.;
        input[[0, 2, y, x]] = (b as f32) / 255.;
    }

    input
}

/// Decodes a YOLOv8 style `[1, 4 + classes, anchors]` output into boxes in
/// original image coordinates, clamped to the image.
fn decode_output(
    output: ArrayViewD<f32>,
    img_width: u32,
    img_height: u32,
    input_size: u32,
    min_probability: f32,
) -> Result<Vec<Candidate>, ModelError> {
    if output.ndim() != 3 || output.shape()[1] < 5 {
        return Err(ModelError::Output(format!(
            "expected shape [1, 4 + classes, anchors], got {:?}",
            output.shape()
        )));
    }

    let (img_width, img_height) = (img_width as f32, img_height as f32);
    let scale = input_size as f32;

    let transposed = output.t();
    let rows = transposed.slice(s![.., .., 0]);
    let mut boxes = Vec::new();

    for row in rows.axis_iter(Axis(0)) {
        let row: Vec<_> = row.iter().copied().collect();
        let Some((class_id, prob)) = row
            .iter()
            .skip(4)
            .copied()
            .enumerate()
            .reduce(|accum, item| if item.1 > accum.1 { item } else { accum })
        else {
            continue;
        };

        if prob < min_probability {
            continue;
        }

        let xc = row[0] / scale * img_width;
        let yc = row[1] / scale * img_height;
        let w = row[2] / scale * img_width;
        let h = row[3] / scale * img_height;

        let candidate = Candidate {
            class_id,
            confidence: prob,
            x1: (xc - w / 2.).clamp(0., img_width),
            y1: (yc - h / 2.).clamp(0., img_height),
            x2: (xc + w / 2.).clamp(0., img_width),
            y2: (yc + h / 2.).clamp(0., img_height),
        };

        if candidate.x2 <= candidate.x1 || candidate.y2 <= candidate.y1 {
            continue;
        }
        boxes.push(candidate);
    }

    Ok(boxes)
}

/// ONNX Runtime backed detector holding a small pool of sessions.
///
/// A session is not shared between concurrent runs: each one sits behind its
/// own mutex and requests are spread over the pool round-robin.
#[derive(Clone)]
pub struct OrtModelService {
    sessions: Arc<Vec<Arc<Mutex<Session>>>>,
    counter: Arc<AtomicUsize>,
    labels: Arc<ClassLabels>,
    min_probability: f32,
    iou_threshold: f32,
    input_size: u32,
}

impl OrtModelService {
    pub fn new(model_config: &ModelConfig, labels: ClassLabels) -> Result<Self, ModelError> {
        model_config.validate().map_err(ModelError::Load)?;

        let num_instances = model_config.num_instances.max(1);
        let sessions = (0..num_instances)
            .map(|_| {
                let session = Session::builder()?
                    .with_optimization_level(GraphOptimizationLevel::Level3)?
                    .commit_from_file(model_config.get_path())?;
                Ok(Arc::new(Mutex::new(session)))
            })
            .collect::<Result<Vec<_>, ort::Error>>()
            .map_err(|e| ModelError::Load(e.to_string()))?;

        tracing::info!(
            "Created {} ONNX sessions for {:?} ({} classes)",
            num_instances,
            model_config.get_path(),
            labels.len()
        );

        Ok(Self {
            sessions: Arc::new(sessions),
            counter: Arc::new(AtomicUsize::new(0)),
            labels: Arc::new(labels),
            min_probability: model_config.min_probability,
            iou_threshold: model_config.iou_threshold,
            input_size: model_config.input_size,
        })
    }

    fn run_inference(&self, input: &Array<f32, Ix4>) -> Result<ArrayD<f32>, ModelError> {
        let index = self.counter.fetch_add(1, Ordering::SeqCst) % self.sessions.len();
        let mut session = self.sessions[index]
            .lock()
            .map_err(|e| ModelError::Inference(format!("session mutex poisoned: {}", e)))?;

        tracing::debug!("Handling request with session {}", index);
        let owned_buffer;
        let input_view = if input.view().is_standard_layout() {
            input.view()
        } else {
            owned_buffer = input.as_standard_layout().into_owned();
            owned_buffer.view()
        };

        let tensor_ref = TensorRef::from_array_view(input_view)
            .map_err(|e| ModelError::Input(e.to_string()))?;

        let outputs = session
            .run(ort::inputs![tensor_ref])
            .map_err(|e| ModelError::Inference(e.to_string()))?;

        let (shape, data) = outputs["output0"]
            .try_extract_tensor::<f32>()
            .map_err(|e| ModelError::Output(format!("failed to extract tensor: {}", e)))?;

        ArrayD::from_shape_vec(shape.to_ixdyn(), data.to_vec())
            .map_err(|e| ModelError::Output(format!("invalid tensor shape: {}", e)))
    }
}

#[async_trait]
impl ModelService for OrtModelService {
    async fn predict(&self, image: &RgbImage) -> Result<Vec<Detection>, ModelError> {
        let (img_width, img_height) = image.dimensions();
        let image = image.clone();
        let service = self.clone();

        let outputs = tokio::task::spawn_blocking(move || {
            let input = to_input_tensor(&image, service.input_size);
            service.run_inference(&input)
        })
        .await
        .map_err(|e| ModelError::Inference(format!("inference task failed: {}", e)))??;

        let candidates = decode_output(
            outputs.view(),
            img_width,
            img_height,
            self.input_size,
            self.min_probability,
        )?;

        let detections = non_max_suppression(candidates, self.iou_threshold)
            .into_iter()
            .map(|candidate| Detection {
                class_id: candidate.class_id,
                label: self.labels.label_for(candidate.class_id),
                confidence: candidate.confidence,
                bbox: [candidate.x1, candidate.y1, candidate.x2, candidate.y2],
            })
            .collect();

        Ok(detections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use ndarray::Array3;

    fn candidate(class_id: usize, confidence: f32, x1: f32, y1: f32, x2: f32, y2: f32) -> Candidate {
        Candidate {
            class_id,
            confidence,
            x1,
            y1,
            x2,
            y2,
        }
    }

    #[test]
    fn test_to_input_tensor() {
        let img = RgbImage::from_pixel(100, 50, Rgb([255, 0, 0]));

        let input = to_input_tensor(&img, 640);

        assert_eq!(input.shape(), &[1, 3, 640, 640]);
        assert!((input[[0, 0, 10, 10]] - 1.0).abs() < 1e-6);
        assert_eq!(input[[0, 1, 10, 10]], 0.0);
    }

    #[test]
    fn test_disjoint_boxes_do_not_intersect() {
        let a = candidate(0, 0.9, 0., 0., 10., 10.);
        let b = candidate(0, 0.8, 20., 20., 30., 30.);
        assert_eq!(intersection(&a, &b), 0.0);
        assert_eq!(iou(&a, &b), 0.0);
    }

    #[test]
    fn test_non_max_suppression_keeps_best_per_class() {
        let boxes = vec![
            candidate(0, 0.6, 1., 1., 101., 101.),
            candidate(0, 0.9, 0., 0., 100., 100.),
            candidate(1, 0.8, 0., 0., 100., 100.),
            candidate(0, 0.5, 300., 300., 400., 400.),
        ];

        let kept = non_max_suppression(boxes, 0.7);

        assert_eq!(kept.len(), 3);
        assert_eq!(kept[0].confidence, 0.9);
        assert_eq!(kept[1].class_id, 1);
        assert_eq!(kept[2].x1, 300.);
    }

    #[test]
    fn test_decode_output_scales_and_filters() {
        // 2 classes, 2 anchors: only the first clears the threshold.
        let mut output = Array3::<f32>::zeros((1, 6, 2));
        output[[0, 0, 0]] = 320.;
        output[[0, 1, 0]] = 320.;
        output[[0, 2, 0]] = 64.;
        output[[0, 3, 0]] = 64.;
        output[[0, 5, 0]] = 0.9;
        output[[0, 4, 1]] = 0.1;

        let boxes = decode_output(output.into_dyn().view(), 1280, 640, 640, 0.25).unwrap();

        assert_eq!(boxes.len(), 1);
        let b = boxes[0];
        assert_eq!(b.class_id, 1);
        assert_eq!([b.x1, b.y1, b.x2, b.y2], [576., 288., 704., 352.]);
    }

    #[test]
    fn test_decode_output_clamps_to_image() {
        let mut output = Array3::<f32>::zeros((1, 5, 1));
        output[[0, 0, 0]] = 5.;
        output[[0, 1, 0]] = 5.;
        output[[0, 2, 0]] = 40.;
        output[[0, 3, 0]] = 40.;
        output[[0, 4, 0]] = 0.8;

        let boxes = decode_output(output.into_dyn().view(), 640, 640, 640, 0.25).unwrap();

        assert_eq!([boxes[0].x1, boxes[0].y1], [0., 0.]);
        assert_eq!([boxes[0].x2, boxes[0].y2], [25., 25.]);
    }

    #[test]
    fn test_decode_output_rejects_bad_shape() {
        let output = Array3::<f32>::zeros((1, 4, 3));
        assert!(matches!(
            decode_output(output.into_dyn().view(), 10, 10, 640, 0.25),
            Err(ModelError::Output(_))
        ));
    }
}
