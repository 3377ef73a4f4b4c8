//! Tool dispatch for agent integrations
//!
//! [`ToolHandler::call`] maps a tool name plus JSON arguments onto the post
//! service and the exporter, always answering with a JSON object whose
//! `status` is `"succeeded"` or `"failed"`. [`serve`] exposes the same tools
//! as line-delimited JSON-RPC 2.0 over any reader/writer pair (stdio in the
//! binary).

use crate::export::export_image;
use crate::post::PostService;
use crate::store::PostStore;
use crate::{Error, RenderSettings, Renderer, Result};
use serde::Serialize;
use serde_json::{json, Value};
use std::io::{BufRead, Write};
use std::path::Path;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

const PROTOCOL_VERSION: &str = "2024-11-05";

// JSON-RPC error codes
const PARSE_ERROR: i64 = -32700;
const INVALID_REQUEST: i64 = -32600;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;

/// Name, description and JSON schema of one tool
#[derive(Debug, Clone, Serialize)]
pub struct ToolDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

pub struct ToolHandler<S: PostStore> {
    service: PostService<S>,
    renderer: Box<dyn Renderer>,
    settings: RenderSettings,
}

impl<S: PostStore> ToolHandler<S> {
    pub fn new(store: S, renderer: Box<dyn Renderer>, settings: RenderSettings) -> Self {
        Self {
            service: PostService::new(store),
            renderer,
            settings,
        }
    }

    pub fn service(&self) -> &PostService<S> {
        &self.service
    }

    pub fn tools(&self) -> Vec<ToolDescriptor> {
        let post_id = json!({"type": "string", "description": "The unique post ID"});
        vec![
            ToolDescriptor {
                name: "create_image_post",
                description: "Create a new HTML image post with fixed canvas dimensions. The HTML/CSS \
                              is rendered at exactly the given width and height. Common sizes: \
                              1080x1080 (Instagram square), 1080x1920 (story), 1200x628 \
                              (Facebook/LinkedIn), 1280x720 (YouTube thumbnail).",
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "name": {"type": "string", "description": "Name of the image post"},
                        "html_content": {
                            "type": "string",
                            "description": "Full HTML/CSS content for the image"
                        },
                        "width": {"type": "integer", "description": "Canvas width in pixels (e.g., 1080)"},
                        "height": {"type": "integer", "description": "Canvas height in pixels (e.g., 1080)"}
                    },
                    "required": ["name", "html_content", "width", "height"]
                }),
            },
            ToolDescriptor {
                name: "update_image_post",
                description: "Update the HTML content of an existing image post. Canvas dimensions \
                              cannot be changed after creation.",
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "post_id": post_id,
                        "html_content": {"type": "string", "description": "The new HTML/CSS content"}
                    },
                    "required": ["post_id", "html_content"]
                }),
            },
            ToolDescriptor {
                name: "get_image_post",
                description: "Retrieve an image post's content and metadata by ID.",
                input_schema: json!({
                    "type": "object",
                    "properties": {"post_id": post_id},
                    "required": ["post_id"]
                }),
            },
            ToolDescriptor {
                name: "list_image_posts",
                description: "List all image posts with their metadata.",
                input_schema: json!({"type": "object", "properties": {}}),
            },
            ToolDescriptor {
                name: "export_image",
                description: "Export an image post as a PNG file, rendered in headless Chrome at \
                              twice the canvas size.",
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "post_id": post_id,
                        "output_path": {
                            "type": "string",
                            "description": "Absolute path for the output PNG file"
                        }
                    },
                    "required": ["post_id", "output_path"]
                }),
            },
            ToolDescriptor {
                name: "add_media",
                description: "Copy an image file into a post's media folder and return the relative \
                              path to use in HTML (e.g. <img src=\"media/photo.jpg\">).",
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "post_id": post_id,
                        "source_path": {
                            "type": "string",
                            "description": "The absolute path to the source media file"
                        }
                    },
                    "required": ["post_id", "source_path"]
                }),
            },
        ]
    }

    /// Run one tool.
    ///
    /// Operation failures come back as `{"status": "failed", "error": ...}`;
    /// only an unknown tool or malformed arguments produce `Err`.
    pub fn call(&self, name: &str, args: &Value) -> Result<Value> {
        match name {
            "create_image_post" => self.create_image_post(args),
            "update_image_post" => self.update_image_post(args),
            "get_image_post" => self.get_image_post(args),
            "list_image_posts" => Ok(self.list_image_posts()),
            "export_image" => self.export_image(args),
            "add_media" => self.add_media(args),
            _ => Err(Error::Tool(format!("unknown tool: {}", name))),
        }
    }

    fn html_path(&self, id: &str) -> String {
        self.service
            .html_path(id)
            .map(|p| p.display().to_string())
            .unwrap_or_default()
    }

    fn create_image_post(&self, args: &Value) -> Result<Value> {
        let name = str_arg(args, "name")?;
        let html = str_arg(args, "html_content")?;
        let width = dimension_arg(args, "width")?;
        let height = dimension_arg(args, "height")?;

        Ok(match self.service.create_post(name, html, width, height) {
            Ok(p) => json!({
                "status": "succeeded",
                "post_id": p.id,
                "name": p.name,
                "width": p.width,
                "height": p.height,
                "file_path": self.html_path(&p.id),
                "created_at": rfc3339(p.created_at),
                "updated_at": rfc3339(p.updated_at),
            }),
            Err(e) => failed("Failed to create image post", e),
        })
    }

    fn update_image_post(&self, args: &Value) -> Result<Value> {
        let id = str_arg(args, "post_id")?;
        let html = str_arg(args, "html_content")?;

        Ok(match self.service.update_post(id, html) {
            Ok(p) => json!({
                "status": "succeeded",
                "post_id": p.id,
                "name": p.name,
                "width": p.width,
                "height": p.height,
                "file_path": self.html_path(&p.id),
                "updated_at": rfc3339(p.updated_at),
            }),
            Err(e) => failed("Failed to update image post", e),
        })
    }

    fn get_image_post(&self, args: &Value) -> Result<Value> {
        let id = str_arg(args, "post_id")?;

        Ok(match self.service.get_post(id) {
            Ok(p) => json!({
                "status": "succeeded",
                "post_id": p.id,
                "name": p.name,
                "html_content": p.html_content,
                "width": p.width,
                "height": p.height,
                "file_path": self.html_path(&p.id),
                "created_at": rfc3339(p.created_at),
                "updated_at": rfc3339(p.updated_at),
            }),
            Err(e) => failed("Failed to get image post", e),
        })
    }

    fn list_image_posts(&self) -> Value {
        match self.service.list_posts() {
            Ok(posts) => {
                let posts: Vec<Value> = posts
                    .iter()
                    .map(|p| {
                        json!({
                            "post_id": p.id,
                            "name": p.name,
                            "width": p.width,
                            "height": p.height,
                            "file_path": self.html_path(&p.id),
                            "created_at": rfc3339(p.created_at),
                            "updated_at": rfc3339(p.updated_at),
                        })
                    })
                    .collect();
                json!({"status": "succeeded", "count": posts.len(), "posts": posts})
            }
            Err(e) => failed("Failed to list image posts", e),
        }
    }

    fn export_image(&self, args: &Value) -> Result<Value> {
        let id = str_arg(args, "post_id")?;
        let output = str_arg(args, "output_path")?;

        let exported = export_image(
            self.service.store(),
            self.renderer.as_ref(),
            &self.settings,
            id,
            Path::new(output),
        );
        Ok(match exported {
            Ok(r) => json!({
                "status": "succeeded",
                "post_id": r.post_id,
                "output_path": r.render.output_path.display().to_string(),
                "pixel_width": r.render.pixel_width,
                "pixel_height": r.render.pixel_height,
                "bytes": r.render.bytes,
                "sha256": r.render.sha256,
                "elapsed_ms": r.render.elapsed_ms,
            }),
            Err(e) => failed("Failed to export image", e),
        })
    }

    fn add_media(&self, args: &Value) -> Result<Value> {
        let id = str_arg(args, "post_id")?;
        let source = str_arg(args, "source_path")?;

        Ok(match self.service.add_media(id, Path::new(source)) {
            Ok(relative) => json!({
                "status": "succeeded",
                "post_id": id,
                "relative_path": relative,
            }),
            Err(e) => failed("Failed to add media", e),
        })
    }
}

fn failed(what: &str, err: Error) -> Value {
    log::warn!("{}: {}", what, err);
    json!({"status": "failed", "error": format!("{}: {}", what, err)})
}

fn rfc3339(t: OffsetDateTime) -> String {
    t.format(&Rfc3339).unwrap_or_else(|_| t.to_string())
}

fn str_arg<'a>(args: &'a Value, key: &str) -> Result<&'a str> {
    match args.get(key).and_then(Value::as_str) {
        Some(s) if !s.is_empty() => Ok(s),
        _ => Err(Error::Tool(format!("{} is required and must be a string", key))),
    }
}

/// Integer argument; clients that only have doubles may send `1080.0`
fn dimension_arg(args: &Value, key: &str) -> Result<u32> {
    let value = args.get(key);
    let n = value
        .and_then(Value::as_u64)
        .or_else(|| {
            value
                .and_then(Value::as_f64)
                .filter(|f| f.fract() == 0.0 && *f >= 0.0 && *f <= f64::from(u32::MAX))
                .map(|f| f as u64)
        })
        .and_then(|n| u32::try_from(n).ok());
    n.ok_or_else(|| Error::Tool(format!("{} is required and must be an integer", key)))
}

/// Answer line-delimited JSON-RPC 2.0 requests from `reader` until EOF.
pub fn serve<S, R, W>(handler: &ToolHandler<S>, reader: R, mut writer: W) -> Result<()>
where
    S: PostStore,
    R: BufRead,
    W: Write,
{
    log::info!("serving tools over JSON-RPC");
    for line in reader.lines() {
        let line = line.map_err(|e| Error::io("failed to read request", e))?;
        if line.trim().is_empty() {
            continue;
        }
        if let Some(response) = handle_line(handler, &line) {
            let encoded = serde_json::to_string(&response)
                .map_err(|e| Error::Tool(format!("failed to encode response: {}", e)))?;
            writeln!(writer, "{}", encoded)
                .and_then(|_| writer.flush())
                .map_err(|e| Error::io("failed to write response", e))?;
        }
    }
    log::info!("input closed, stopping");
    Ok(())
}

fn handle_line<S: PostStore>(handler: &ToolHandler<S>, line: &str) -> Option<Value> {
    let request: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => return Some(rpc_error(Value::Null, PARSE_ERROR, format!("Parse error: {}", e))),
    };
    let id = request.get("id").cloned();
    let method = match request.get("method").and_then(Value::as_str) {
        Some(m) => m,
        None => {
            return Some(rpc_error(
                id.unwrap_or(Value::Null),
                INVALID_REQUEST,
                "Invalid request: missing method".to_string(),
            ))
        }
    };
    let params = request.get("params").cloned().unwrap_or_else(|| json!({}));

    let outcome = dispatch(handler, method, &params);
    // Notifications never get a reply.
    let id = id?;
    Some(match outcome {
        Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
        Err((code, message)) => rpc_error(id, code, message),
    })
}

fn dispatch<S: PostStore>(
    handler: &ToolHandler<S>,
    method: &str,
    params: &Value,
) -> std::result::Result<Value, (i64, String)> {
    match method {
        "initialize" => {
            let version = params
                .get("protocolVersion")
                .and_then(Value::as_str)
                .unwrap_or(PROTOCOL_VERSION);
            Ok(json!({
                "protocolVersion": version,
                "capabilities": {"tools": {}},
                "serverInfo": {"name": env!("CARGO_PKG_NAME"), "version": env!("CARGO_PKG_VERSION")},
            }))
        }
        "ping" => Ok(json!({})),
        "tools/list" => Ok(json!({"tools": handler.tools()})),
        "tools/call" => {
            let name = params
                .get("name")
                .and_then(Value::as_str)
                .ok_or((INVALID_PARAMS, "tools/call requires a tool name".to_string()))?;
            let args = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
            let result = handler
                .call(name, &args)
                .map_err(|e| (INVALID_PARAMS, e.to_string()))?;
            let is_error = result.get("status").and_then(Value::as_str) == Some("failed");
            let text = serde_json::to_string_pretty(&result).unwrap_or_else(|_| result.to_string());
            Ok(json!({
                "content": [{"type": "text", "text": text}],
                "isError": is_error,
            }))
        }
        m if m.starts_with("notifications/") => Ok(Value::Null),
        m => Err((METHOD_NOT_FOUND, format!("Method not found: {}", m))),
    }
}

fn rpc_error(id: Value, code: i64, message: String) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dimensions_accept_integral_floats_only() {
        let args = json!({"a": 1080, "b": 1080.0, "c": 10.5, "d": -1, "e": "1080"});
        assert_eq!(dimension_arg(&args, "a").unwrap(), 1080);
        assert_eq!(dimension_arg(&args, "b").unwrap(), 1080);
        assert!(dimension_arg(&args, "c").is_err());
        assert!(dimension_arg(&args, "d").is_err());
        assert!(dimension_arg(&args, "e").is_err());
        assert!(dimension_arg(&args, "missing").is_err());
    }

    #[test]
    fn string_args_must_be_non_empty() {
        let args = json!({"post_id": "", "name": "x"});
        assert!(matches!(str_arg(&args, "post_id"), Err(Error::Tool(_))));
        assert_eq!(str_arg(&args, "name").unwrap(), "x");
    }

    #[test]
    fn timestamps_are_rfc3339() {
        let t = time::macros::datetime!(2024-05-01 12:30:00 UTC);
        assert_eq!(rfc3339(t), "2024-05-01T12:30:00Z");
    }
}
