// src/recognize.rs

use crate::config::{VisionBackend, VisionSection};
use crate::reconcile::RawLineItem;
use crate::sheet_db::SheetStore;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// The prompt that instructs the model to read a handwritten order sheet.
const VISION_PROMPT: &str = r#"You are an order sheet reading assistant.
The image is a photograph of a handwritten supplier order sheet, usually in
Chinese. Extract every product line and return ONLY a valid JSON array.

Each element must match this schema exactly, all values as strings:
[
  {
    "name": "product name as written",
    "quantity": "quantity as written, may include units",
    "unit_price": "unit price as written, may include currency marks",
    "line_total": "line total as written",
    "category": "one of: fish, pork, chicken, duck, vegetable, beef, mutton, seasoning, consumable, other"
  }
]

Notes:
- Use the empty string "" for any field you cannot read. Never use null and
  never omit a key.
- Copy the handwriting as-is, including units like 斤 or 元. Do not compute
  or fix any numbers.
- Return ONLY the JSON array, no markdown fences, no commentary."#;

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f64,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: Vec<ContentPart>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ReplyMessage,
}

#[derive(Debug, Deserialize)]
struct ReplyMessage {
    content: String,
}

/// Resolved endpoint configuration ready to make API calls.
pub struct ResolvedEndpoint {
    base_url: String,
    model: String,
    api_key: String,
}

/// Resolve the vision config section into a concrete endpoint.
pub fn resolve_endpoint(
    vision: &VisionSection,
) -> Result<ResolvedEndpoint, Box<dyn std::error::Error>> {
    match vision.backend {
        VisionBackend::Ollama => {
            info!(
                url = %vision.ollama.base_url,
                model = %vision.ollama.model,
                "Using Ollama (local) backend"
            );
            Ok(ResolvedEndpoint {
                base_url: vision.ollama.base_url.clone(),
                model: vision.ollama.model.clone(),
                api_key: "ollama".to_string(), // required by API but ignored
            })
        }
        VisionBackend::Cliproxy => {
            info!(
                url = %vision.cliproxy.base_url,
                model = %vision.cliproxy.model,
                "Using CLIProxyAPI backend"
            );
            Ok(ResolvedEndpoint {
                base_url: vision.cliproxy.base_url.clone(),
                model: vision.cliproxy.model.clone(),
                api_key: "cliproxy".to_string(), // CLIProxyAPI uses OAuth, not API keys
            })
        }
        VisionBackend::Remote => {
            let api_key = std::env::var("VISION_API_KEY")
                .map_err(|_| "VISION_API_KEY env var required for remote backend")?;
            info!(
                url = %vision.remote.base_url,
                model = %vision.remote.model,
                "Using remote API backend"
            );
            Ok(ResolvedEndpoint {
                base_url: vision.remote.base_url.clone(),
                model: vision.remote.model.clone(),
                api_key,
            })
        }
    }
}

/// Check if the Ollama server is reachable.
async fn check_ollama_health(client: &Client, base_url: &str) -> bool {
    // Ollama's health endpoint is at the root (not under /v1)
    let health_url = base_url.trim_end_matches("/v1").trim_end_matches("/v1/");

    match client
        .get(health_url)
        .timeout(std::time::Duration::from_secs(3))
        .send()
        .await
    {
        Ok(resp) => {
            if resp.status().is_success() {
                info!("Ollama server is reachable");
                true
            } else {
                warn!(status = %resp.status(), "Ollama server returned non-OK status");
                false
            }
        }
        Err(e) => {
            warn!(error = %e, "Ollama server not reachable");
            false
        }
    }
}

/// Send one sheet photo to the vision model and parse the recognized lines.
pub async fn recognize_sheet(
    client: &Client,
    endpoint: &ResolvedEndpoint,
    image_data: &[u8],
    mime: &str,
) -> Result<Vec<RawLineItem>, Box<dyn std::error::Error>> {
    let encoded = BASE64.encode(image_data);
    let data_url = format!("data:{mime};base64,{encoded}");

    let request = ChatRequest {
        model: endpoint.model.clone(),
        messages: vec![ChatMessage {
            role: "user".to_string(),
            content: vec![
                ContentPart::Text {
                    text: VISION_PROMPT.to_string(),
                },
                ContentPart::ImageUrl {
                    image_url: ImageUrl { url: data_url },
                },
            ],
        }],
        temperature: 0.0,
    };

    let url = format!("{}/chat/completions", endpoint.base_url);

    let response = client
        .post(&url)
        .header("Authorization", format!("Bearer {}", endpoint.api_key))
        .json(&request)
        .send()
        .await?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(format!("Vision API error {status}: {body}").into());
    }

    let chat_response: ChatResponse = response.json().await?;
    let content = chat_response
        .choices
        .first()
        .map(|c| c.message.content.as_str())
        .ok_or("Empty response from vision model")?;

    // Strip markdown fences if the model added them despite instructions
    let json_str = content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    // Some models prepend reasoning text. Slice out just the JSON array.
    let json_str = extract_json_array(json_str)?;

    let items: Vec<RawLineItem> = serde_json::from_str(json_str).map_err(|e| {
        format!("Failed to parse vision response as line items: {e}\nRaw: {json_str}")
    })?;

    Ok(items)
}

/// Extract the outermost JSON array from a string that may contain
/// surrounding text (e.g. thinking tokens). A payload with no array at all
/// is a malformed response, not a missing value.
fn extract_json_array(s: &str) -> Result<&str, Box<dyn std::error::Error>> {
    let start = s.find('[').ok_or("No '[' found in vision response")?;
    let end = s.rfind(']').ok_or("No ']' found in vision response")?;
    if end <= start {
        return Err("Malformed JSON in vision response".into());
    }
    Ok(&s[start..=end])
}

/// Recognize a single sheet photo (for the test-image debug path).
pub async fn recognize_single(
    image_data: &[u8],
    mime: &str,
    vision: &VisionSection,
) -> Result<Vec<RawLineItem>, Box<dyn std::error::Error>> {
    let endpoint = resolve_endpoint(vision)?;
    let client = Client::new();

    if vision.backend == VisionBackend::Ollama {
        if !check_ollama_health(&client, &endpoint.base_url).await {
            return Err(format!(
                "Ollama is not running at {}. Start it with: ollama serve",
                endpoint.base_url
            )
            .into());
        }
    }

    recognize_sheet(&client, &endpoint, image_data, mime).await
}

/// Run recognition on all sheets still waiting for it. Failures are stored
/// as data on the sheet row and never abort the batch.
pub async fn run_recognition(
    db: &SheetStore,
    vision: &VisionSection,
) -> Result<(), Box<dyn std::error::Error>> {
    let endpoint = resolve_endpoint(vision)?;
    let client = Client::new();

    // Health check for the local backend
    if vision.backend == VisionBackend::Ollama {
        if !check_ollama_health(&client, &endpoint.base_url).await {
            return Err(format!(
                "Ollama is not running at {}. Start it with: ollama serve",
                endpoint.base_url
            )
            .into());
        }
    }

    let pending = db.get_pending_sheets()?;
    info!(
        count = pending.len(),
        backend = ?vision.backend,
        model = %endpoint.model,
        "Sheets waiting for recognition"
    );

    for sheet in &pending {
        let span = tracing::info_span!("recognize", uid = %sheet.uid, filename = %sheet.filename);
        let _guard = span.enter();

        match recognize_sheet(&client, &endpoint, &sheet.image_data, &sheet.mime).await {
            Ok(items) if items.is_empty() => {
                warn!("Recognizer returned no line items");
                db.set_recognition(&sheet.uid, "empty", Some("recognizer returned no line items"))?;
            }
            Ok(items) => {
                info!(lines = items.len(), "Recognition result");
                db.replace_items(&sheet.uid, &items)?;
                db.set_recognition(&sheet.uid, "ok", None)?;
            }
            Err(e) => {
                tracing::error!(error = %e, "Recognition failed");
                let msg = e.to_string();
                db.set_recognition(&sheet.uid, "error", Some(msg.as_str()))?;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_array_plain() {
        let s = r#"[{"name": "a"}]"#;
        assert_eq!(extract_json_array(s).unwrap(), s);
    }

    #[test]
    fn test_extract_json_array_with_surrounding_text() {
        let s = "Here is the data:\n[{\"name\": \"a\"}]\nDone.";
        assert_eq!(extract_json_array(s).unwrap(), r#"[{"name": "a"}]"#);
    }

    #[test]
    fn test_extract_json_array_garbage() {
        assert!(extract_json_array("no json here").is_err());
        assert!(extract_json_array("] backwards [").is_err());
    }

    #[test]
    fn test_payload_parses_into_raw_items() {
        let payload = r#"[
            {"name": "雪花纯生", "quantity": "5", "unit_price": "85", "line_total": "425", "category": "other"},
            {"name": "羊肉", "quantity": "23斤", "unit_price": "15.9", "line_total": "", "category": "mutton"}
        ]"#;
        let items: Vec<RawLineItem> = serde_json::from_str(payload).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].name, "雪花纯生");
        assert_eq!(items[1].quantity_raw.as_deref(), Some("23斤"));
        assert_eq!(items[1].line_total_raw.as_deref(), Some(""));
    }
}
