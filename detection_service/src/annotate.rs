use crate::{config::AnnotationConfig, detection::Detection};
use ab_glyph::{FontRef, PxScale};
use image::{Rgb, RgbImage};
use imageproc::{
    drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size},
    rect::Rect,
};
use thiserror::Error;

const FONT_DATA: &[u8] = include_bytes!("../assets/DejaVuSans.ttf");

const BOX_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
// Space between the text and the edge of its tag.
const LABEL_PADDING: u32 = 2;
// Distance between the tag and the top edge of its box.
const LABEL_OFFSET: i32 = 4;

#[derive(Error, Debug)]
pub enum AnnotateError {
    #[error("Failed to load label font: {0}")]
    Font(String),
}

/// Where a label tag is drawn, in image pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LabelPlacement {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

/// Positions the tag for one box. The tag goes above the box when it fits,
/// otherwise just inside the top edge, and is clamped into the image.
pub fn place_label(
    bbox: [f32; 4],
    text_width: u32,
    text_height: u32,
    image_width: u32,
    image_height: u32,
) -> Option<LabelPlacement> {
    if image_width == 0 || image_height == 0 {
        return None;
    }

    let width = (text_width + 2 * LABEL_PADDING).min(image_width);
    let height = (text_height + 2 * LABEL_PADDING).min(image_height);

    let x1 = bbox[0].round() as i32;
    let y1 = bbox[1].round() as i32;
    let above = y1 - text_height as i32 - LABEL_OFFSET;
    let y = if above > 0 { above } else { y1 + LABEL_OFFSET };

    Some(LabelPlacement {
        x: x1.clamp(0, (image_width - width) as i32),
        y: y.clamp(0, (image_height - height) as i32),
        width,
        height,
    })
}

fn box_rect(bbox: [f32; 4], image_width: u32, image_height: u32) -> Option<Rect> {
    let (w, h) = (image_width as i32, image_height as i32);
    let x_min = (bbox[0].min(bbox[2]).round() as i32).clamp(0, w - 1);
    let y_min = (bbox[1].min(bbox[3]).round() as i32).clamp(0, h - 1);
    let x_max = (bbox[0].max(bbox[2]).round() as i32).clamp(0, w - 1);
    let y_max = (bbox[1].max(bbox[3]).round() as i32).clamp(0, h - 1);

    if x_max <= x_min || y_max <= y_min {
        return None;
    }
    Some(Rect::at(x_min, y_min).of_size((x_max - x_min + 1) as u32, (y_max - y_min + 1) as u32))
}

pub struct Annotator {
    font: FontRef<'static>,
    scale: PxScale,
    line_width: u32,
}

impl Annotator {
    pub fn new(config: &AnnotationConfig) -> Result<Self, AnnotateError> {
        let font =
            FontRef::try_from_slice(FONT_DATA).map_err(|e| AnnotateError::Font(e.to_string()))?;

        Ok(Self {
            font,
            scale: PxScale::from(config.font_size),
            line_width: config.line_width.max(1),
        })
    }

    pub fn label_size(&self, text: &str) -> (u32, u32) {
        text_size(self.scale, &self.font, text)
    }

    /// Draws every detection's outline and label tag onto `image`.
    pub fn annotate(&self, image: &mut RgbImage, detections: &[Detection]) {
        if image.width() == 0 || image.height() == 0 {
            return;
        }

        for detection in detections {
            self.draw_box(image, detection.bbox);
            self.draw_label(image, detection.bbox, &detection.label);
        }
    }

    fn draw_box(&self, image: &mut RgbImage, bbox: [f32; 4]) {
        let Some(rect) = box_rect(bbox, image.width(), image.height()) else {
            return;
        };

        // Inner rings thicken the outline without spilling past the box.
        let max_inset = (rect.width().min(rect.height()) / 2) as i32;
        for inset in 0..(self.line_width as i32).min(max_inset.max(1)) {
            let inner = Rect::at(rect.left() + inset, rect.top() + inset).of_size(
                rect.width().saturating_sub(2 * inset as u32).max(1),
                rect.height().saturating_sub(2 * inset as u32).max(1),
            );
            draw_hollow_rect_mut(image, inner, BOX_COLOR);
        }
    }

    fn draw_label(&self, image: &mut RgbImage, bbox: [f32; 4], text: &str) {
        let (text_width, text_height) = self.label_size(text);
        let Some(tag) = place_label(bbox, text_width, text_height, image.width(), image.height())
        else {
            return;
        };

        draw_filled_rect_mut(
            image,
            Rect::at(tag.x, tag.y).of_size(tag.width, tag.height),
            BOX_COLOR,
        );
        draw_text_mut(
            image,
            TEXT_COLOR,
            tag.x + LABEL_PADDING as i32,
            tag.y + LABEL_PADDING as i32,
            self.scale,
            &self.font,
            text,
        );
    }
}
