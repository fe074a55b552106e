//! Server-rendered pages. User and service supplied text is entity-encoded
//! before it reaches the markup.

use crate::detection_client::{DetectionReply, DetectionResult, UploadedImage};
use base64::{engine::general_purpose::STANDARD, Engine as _};

const TITLE: &str = "AI-Based Food Recognition";

const STYLE: &str = r#"
body { font-family: sans-serif; max-width: 760px; margin: 2rem auto; padding: 0 1rem; }
figure { margin: 1rem 0; }
figure img { max-width: 100%; }
figcaption { color: #666; font-size: 0.9rem; }
.success { background: #e6f4ea; padding: 0.75rem; border-radius: 4px; }
.info { background: #e8f0fe; padding: 0.75rem; border-radius: 4px; }
.error { background: #fce8e6; padding: 0.75rem; border-radius: 4px; white-space: pre-wrap; }
#spinner { display: none; margin-top: 1rem; }
"#;

const UPLOAD_SCRIPT: &str = r#"
const input = document.getElementById('file');
const preview = document.getElementById('preview');
input.addEventListener('change', () => {
  const [file] = input.files;
  if (file) {
    preview.src = URL.createObjectURL(file);
    preview.parentElement.style.display = 'block';
  }
});
document.getElementById('upload').addEventListener('submit', () => {
  document.getElementById('submit').disabled = true;
  document.getElementById('spinner').style.display = 'block';
});
"#;

/// Entity-encodes text for an element body.
pub fn escape(text: &str) -> String {
    html_escape::encode_text(text).into_owned()
}

fn escape_attribute(value: &str) -> String {
    html_escape::encode_double_quoted_attribute(value).into_owned()
}

fn page(body: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n\
         <title>{title}</title>\n<style>{style}</style>\n</head>\n<body>\n\
         <h1>{title}</h1>\n{body}\n</body>\n</html>\n",
        title = TITLE,
        style = STYLE,
        body = body
    )
}

fn figure(src: &str, caption: &str) -> String {
    format!(
        "<figure><img src=\"{}\" alt=\"{}\"><figcaption>{}</figcaption></figure>",
        escape_attribute(src),
        escape_attribute(caption),
        escape(caption)
    )
}

fn data_url(content_type: &str, base64_data: &str) -> String {
    format!("data:{};base64,{}", content_type, base64_data)
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn render_nutrient_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn render_nutrition(reply: &DetectionReply) -> String {
    if reply.nutrition_info.is_empty() {
        return "<p class=\"info\">No nutritional data found.</p>".to_string();
    }

    let mut html = String::from("<h2>Nutrition Info</h2>\n");
    for (item, data) in &reply.nutrition_info {
        html.push_str(&format!("<h3>{}</h3>\n", escape(&capitalize(item))));
        match data.as_object() {
            Some(nutrients) => {
                html.push_str("<ul>\n");
                for (name, value) in nutrients {
                    html.push_str(&format!(
                        "<li>{}: {}</li>\n",
                        escape(name),
                        escape(&render_nutrient_value(value))
                    ));
                }
                html.push_str("</ul>\n");
            }
            None => html.push_str(&format!("<p>{}</p>\n", escape(&render_nutrient_value(data)))),
        }
    }
    html
}

/// The upload form. Picking a file previews it right away and submitting
/// shows a progress line until the result page loads.
pub fn render_index() -> String {
    page(&format!(
        "<p>Upload a food image and detect food items using YOLOv8.</p>\n\
         <form id=\"upload\" action=\"/detect\" method=\"post\" enctype=\"multipart/form-data\">\n\
         <input id=\"file\" type=\"file\" name=\"file\" accept=\".jpg,.jpeg,.png,image/jpeg,image/png\" required>\n\
         <button id=\"submit\" type=\"submit\">Detect</button>\n\
         </form>\n\
         <figure style=\"display:none\"><img id=\"preview\" alt=\"Uploaded Image\">\
         <figcaption>Uploaded Image</figcaption></figure>\n\
         <p id=\"spinner\">Detecting food items...</p>\n\
         <script>{}</script>",
        UPLOAD_SCRIPT
    ))
}

pub fn render_result(upload: &UploadedImage, result: &DetectionResult) -> String {
    let uploaded = figure(
        &data_url(&upload.content_type, &STANDARD.encode(&upload.data)),
        "Uploaded Image",
    );

    let body = match result {
        DetectionResult::Success(reply) => {
            let image = match &reply.image {
                Some(annotated) => figure(&data_url("image/png", annotated), "Annotated Image"),
                None => uploaded,
            };
            let detected = if reply.foods_detected.is_empty() {
                "No food items detected.".to_string()
            } else {
                escape(&reply.foods_detected.join(", "))
            };

            format!(
                "{}\n<p class=\"success\">Detection complete!</p>\n\
                 <h2>Detected Items</h2>\n<p>{}</p>\n{}",
                image,
                detected,
                render_nutrition(reply)
            )
        }
        DetectionResult::Failed { status, body } => format!(
            "{}\n<p class=\"error\">Error {}: {}</p>",
            uploaded,
            status,
            escape(body)
        ),
    };

    page(&format!(
        "{}\n<p><a href=\"/\">Upload another image</a></p>",
        body
    ))
}

pub fn render_failure(message: &str) -> String {
    page(&format!(
        "<p class=\"error\">{}</p>\n<p><a href=\"/\">Back</a></p>",
        escape(message)
    ))
}
