use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use rfcanvas::store::FsPostStore;
use rfcanvas::tools::{self, ToolHandler};
use rfcanvas::{RenderSettings, Renderer};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "rfcanvas", version, about = "Render HTML posts to pixel-exact PNG images")]
struct Cli {
    /// Directory holding one sub-directory per post
    #[arg(long, env = "RFCANVAS_ROOT_DIR", global = true)]
    root_dir: Option<PathBuf>,

    /// Overall deadline for one export, in seconds
    #[arg(long, env = "RFCANVAS_TIMEOUT_SECS", default_value_t = 30, global = true)]
    timeout_secs: u64,

    /// Chrome/Chromium binary to use instead of searching for one
    #[arg(long, env = "RFCANVAS_CHROME", global = true)]
    chrome: Option<PathBuf>,

    /// Launch Chrome without its sandbox (needed when running as root in containers)
    #[arg(long, global = true)]
    no_sandbox: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a new post
    Create {
        name: String,
        #[command(flatten)]
        html: HtmlSource,
        #[arg(long)]
        width: u32,
        #[arg(long)]
        height: u32,
    },
    /// Replace a post's HTML
    Update {
        post_id: String,
        #[command(flatten)]
        html: HtmlSource,
    },
    /// Show a post and its HTML
    Get { post_id: String },
    /// List all posts
    List,
    /// Render a post to PNG
    Export {
        post_id: String,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Copy a media file into a post
    AddMedia { post_id: String, source: PathBuf },
    /// Delete a post and its media
    Delete { post_id: String },
    /// Answer JSON-RPC tool calls on stdin/stdout
    Serve,
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct HtmlSource {
    /// HTML content
    #[arg(long)]
    html: Option<String>,
    /// Read HTML content from a file
    #[arg(long)]
    html_file: Option<PathBuf>,
}

impl HtmlSource {
    fn load(&self) -> anyhow::Result<String> {
        match (&self.html, &self.html_file) {
            (Some(html), _) => Ok(html.clone()),
            (None, Some(path)) => {
                std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
            }
            (None, None) => bail!("--html or --html-file is required"),
        }
    }
}

fn default_root_dir() -> anyhow::Result<PathBuf> {
    let home = std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .context("failed to get user home directory; set RFCANVAS_ROOT_DIR")?;
    Ok(Path::new(&home).join(".rfcanvas").join("posts"))
}

#[cfg(feature = "cdp")]
fn make_renderer(cli: &Cli) -> Box<dyn Renderer> {
    use rfcanvas::cdp::{CdpConfig, CdpRenderer};
    use rfcanvas::discovery::SearchPolicy;

    let mut config = CdpConfig::default();
    if let Some(path) = &cli.chrome {
        config.search = SearchPolicy::explicit(path);
    }
    config.sandbox = !cli.no_sandbox;
    Box::new(CdpRenderer::new(config))
}

#[cfg(not(feature = "cdp"))]
fn make_renderer(_cli: &Cli) -> Box<dyn Renderer> {
    Box::new(|_: &rfcanvas::RenderTarget<'_>| -> rfcanvas::Result<Vec<u8>> {
        Err(rfcanvas::Error::EngineUnavailable(
            "built without the `cdp` feature".to_string(),
        ))
    })
}

fn print_json(value: &Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    // stdout carries JSON, so logs go to stderr
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let cli = Cli::parse();
    let root = match &cli.root_dir {
        Some(dir) => dir.clone(),
        None => default_root_dir()?,
    };
    let store = FsPostStore::open(&root)?;
    log::debug!("using post store at {}", root.display());

    let settings = RenderSettings {
        timeout: Duration::from_secs(cli.timeout_secs),
        ..Default::default()
    };
    let handler = ToolHandler::new(store, make_renderer(&cli), settings);

    let (tool, args) = match &cli.command {
        Command::Create {
            name,
            html,
            width,
            height,
        } => (
            "create_image_post",
            json!({"name": name, "html_content": html.load()?, "width": width, "height": height}),
        ),
        Command::Update { post_id, html } => (
            "update_image_post",
            json!({"post_id": post_id, "html_content": html.load()?}),
        ),
        Command::Get { post_id } => ("get_image_post", json!({"post_id": post_id})),
        Command::List => ("list_image_posts", json!({})),
        Command::Export { post_id, output } => {
            let output = if output.is_absolute() {
                output.clone()
            } else {
                std::env::current_dir()
                    .context("failed to resolve output path")?
                    .join(output)
            };
            ("export_image", json!({"post_id": post_id, "output_path": output}))
        }
        Command::AddMedia { post_id, source } => (
            "add_media",
            json!({"post_id": post_id, "source_path": source}),
        ),
        Command::Delete { post_id } => {
            handler.service().delete_post(post_id)?;
            return print_json(&json!({"status": "succeeded", "post_id": post_id}));
        }
        Command::Serve => {
            let stdin = std::io::stdin();
            let stdout = std::io::stdout();
            tools::serve(&handler, stdin.lock(), stdout.lock())?;
            return Ok(());
        }
    };

    let result = handler.call(tool, &args)?;
    print_json(&result)?;
    if result.get("status").and_then(Value::as_str) == Some("failed") {
        std::process::exit(1);
    }
    Ok(())
}
