use std::io::{self, BufRead};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;

use maskforge::mask::{PromptStroke, NEGATIVE_STROKE, POSITIVE_STROKE};
use maskforge::output::encode_jpeg;
use maskforge::prompt::PromptBox;
use maskforge::segmentation::{self, AutoMaskConfig, ScriptedBackend, SegmentationBackend};
use maskforge::session::{default_save_root, Action, InputMode, SessionConfig, SessionRegistry};
use maskforge::{input, SessionError, SessionId, ViewMode};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// SAM image encoder (ONNX file)
    /// Without encoder and decoder every inference fails; strokes, undo and saves still work
    #[arg(long, requires = "decoder")]
    encoder: Option<PathBuf>,

    /// SAM prompt decoder (ONNX file)
    #[arg(long, requires = "encoder")]
    decoder: Option<PathBuf>,

    /// Image to upload at startup
    #[arg(short, long)]
    image: Option<PathBuf>,

    /// Directory that receives <label>/<n>.png saves [default: $HOME/Downloads]
    #[arg(long)]
    save_root: Option<PathBuf>,

    /// Initial dilation kernel for the coloured mask views (0-20)
    #[arg(long, default_value_t = 0)]
    dilation: u32,

    /// Initial background blur level (0-25)
    #[arg(long, default_value_t = 0)]
    blur: u32,

    /// Give up on an inference after this many seconds
    #[arg(long)]
    backend_timeout_secs: Option<u64>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Automatic masks: grid points along each image side
    #[arg(long, default_value_t = 32)]
    points_per_side: u32,

    /// Automatic masks: minimum predicted IoU
    #[arg(long, default_value_t = 0.88)]
    pred_iou_thresh: f32,

    /// Automatic masks: minimum stability score
    #[arg(long, default_value_t = 0.95)]
    stability_score_thresh: f32,

    /// Automatic masks: logit offset for the stability score
    #[arg(long, default_value_t = 1.0)]
    stability_score_offset: f32,

    /// Automatic masks: box IoU for duplicate suppression
    #[arg(long, default_value_t = 0.7)]
    box_nms_thresh: f32,

    /// Automatic masks: smallest kept mask, in pixels
    #[arg(long, default_value_t = 0)]
    min_mask_region_area: usize,
}

impl Args {
    fn auto_mask_config(&self) -> AutoMaskConfig {
        AutoMaskConfig {
            points_per_side: self.points_per_side,
            pred_iou_thresh: self.pred_iou_thresh,
            stability_score_thresh: self.stability_score_thresh,
            stability_score_offset: self.stability_score_offset,
            box_nms_thresh: self.box_nms_thresh,
            min_mask_region_area: self.min_mask_region_area,
        }
    }

    fn session_config(&self) -> Result<SessionConfig> {
        let composite = SessionConfig::default()
            .composite
            .with_dilation(self.dilation)?
            .with_blur(self.blur)?;
        Ok(SessionConfig {
            backend_timeout: self.backend_timeout_secs.map(Duration::from_secs),
            save_root: self.save_root.clone().unwrap_or_else(default_save_root),
            composite,
            ..SessionConfig::default()
        })
    }
}

/// One line of driver input
#[derive(Debug, Clone, PartialEq)]
enum Command {
    Apply(Action),
    Save { view: ViewMode, label: String },
    SaveRoot(PathBuf),
    Load(PathBuf),
    Write(PathBuf),
    Quit,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    tracing::info!("maskforge starting");

    let config = args.session_config()?;
    tracing::info!("Save root: {}", config.save_root.display());
    if let Some(timeout) = config.backend_timeout {
        tracing::info!("Backend timeout: {:?}", timeout);
    }

    let registry = match (&args.encoder, &args.decoder) {
        (Some(encoder), Some(decoder)) => {
            tracing::info!(
                "Loading SAM model from {} and {}",
                encoder.display(),
                decoder.display()
            );
            let factory = segmentation::create_default_factory(encoder, decoder, args.auto_mask_config())
                .context("Failed to load segmentation model")?;
            tracing::info!("Segmentation model loaded successfully");
            SessionRegistry::new(factory, config)
        }
        _ => {
            tracing::info!("No model given, inference is unavailable");
            SessionRegistry::new(
                || {
                    Box::new(ScriptedBackend::unavailable(
                        "no segmentation model configured",
                    )) as Box<dyn SegmentationBackend>
                },
                config,
            )
        }
    };

    let id = registry.create();

    if let Some(path) = &args.image {
        let image = input::load_image(path)
            .with_context(|| format!("Failed to load {}", path.display()))?;
        registry.with_session(id, |s| s.upload(image).map(|_| ()))?;
    }

    run_commands(&registry, id, io::stdin().lock())
}

fn run_commands<R: BufRead>(registry: &SessionRegistry, id: SessionId, reader: R) -> Result<()> {
    tracing::info!("Reading commands from stdin, 'quit' to stop");

    for (number, line) in reader.lines().enumerate() {
        let line = line.context("Failed to read command")?;
        let command = match parse_command(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                tracing::warn!("line {}: {:#}", number + 1, e);
                continue;
            }
        };
        if command == Command::Quit {
            break;
        }

        let started = Instant::now();
        match registry.with_session(id, |s| execute(s, command)) {
            Ok(summary) => tracing::info!("{} ({:.1}ms)", summary, started.elapsed().as_secs_f64() * 1000.0),
            Err(e) if e.is_recoverable() => {
                tracing::warn!("line {}: {} [{}]", number + 1, e, e.code())
            }
            Err(e) => tracing::error!("line {}: {} [{}]", number + 1, e, e.code()),
        }
    }

    registry.remove(id)?;
    tracing::info!("maskforge stopped");
    Ok(())
}

fn execute(session: &mut maskforge::Session, command: Command) -> maskforge::Result<String> {
    match command {
        Command::Apply(action) => {
            let (width, height, encoded) = {
                let view = session.apply(action)?;
                (view.width(), view.height(), encode_jpeg(view)?)
            };
            Ok(format!(
                "{} view {}x{}, {} bytes, {} layers",
                session.view_mode(),
                width,
                height,
                encoded.len(),
                session.layers().len()
            ))
        }
        Command::Save { view, label } => {
            let path = session.save(view, &label)?;
            Ok(format!("saved {} to {}", view, path.display()))
        }
        Command::SaveRoot(path) => {
            session.set_save_root(&path)?;
            Ok(format!("save root {}", path.display()))
        }
        Command::Load(path) => {
            let image = input::load_image(&path)?;
            let (width, height) = session.upload(image)?.dimensions();
            Ok(format!("loaded {} ({}x{})", path.display(), width, height))
        }
        Command::Write(path) => {
            let bytes = encode_jpeg(session.current_view()?)?;
            std::fs::write(&path, &bytes).map_err(|source| SessionError::Io {
                path: path.clone(),
                source,
            })?;
            Ok(format!("wrote {} bytes to {}", bytes.len(), path.display()))
        }
        Command::Quit => Ok(String::new()),
    }
}

fn parse_command(line: &str) -> Result<Option<Command>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let rest: Vec<&str> = words.collect();

    let command = match verb {
        "show" => Command::Apply(Action::Show(parse_view(one(&rest)?)?)),
        "mode" => Command::Apply(Action::SetInputMode(parse_mode(one(&rest)?)?)),
        "point" => {
            let [x, y] = floats::<2>(&rest)?;
            Command::Apply(Action::AddPoint { x, y })
        }
        "box" => {
            let [x1, y1, x2, y2] = floats::<4>(&rest)?;
            Command::Apply(Action::AddBox(PromptBox::new(x1, y1, x2, y2)))
        }
        "stroke" => Command::Apply(Action::Stroke(parse_stroke(&rest)?)),
        "infer" => Command::Apply(Action::RunInference),
        "undo" => Command::Apply(Action::Undo),
        "clear" => Command::Apply(Action::Clear),
        "dilate" => Command::Apply(Action::SetDilation(one(&rest)?.parse()?)),
        "blur" => Command::Apply(Action::SetBlur(one(&rest)?.parse()?)),
        "save" => match rest.as_slice() {
            [view, label] => Command::Save {
                view: parse_view(view)?,
                label: label.to_string(),
            },
            _ => bail!("usage: save <view> <label>"),
        },
        "root" => Command::SaveRoot(PathBuf::from(one(&rest)?)),
        "load" => Command::Load(PathBuf::from(one(&rest)?)),
        "write" => Command::Write(PathBuf::from(one(&rest)?)),
        "quit" | "exit" => Command::Quit,
        other => bail!("unknown command '{other}'"),
    };
    Ok(Some(command))
}

fn one<'a>(rest: &[&'a str]) -> Result<&'a str> {
    match rest {
        [only] => Ok(only),
        _ => bail!("expected exactly one argument, got {}", rest.len()),
    }
}

fn floats<const N: usize>(rest: &[&str]) -> Result<[f32; N]> {
    if rest.len() != N {
        bail!("expected {} numbers, got {}", N, rest.len());
    }
    let mut out = [0.0; N];
    for (slot, word) in out.iter_mut().zip(rest) {
        *slot = word
            .parse()
            .with_context(|| format!("'{word}' is not a number"))?;
    }
    Ok(out)
}

fn parse_view(word: &str) -> Result<ViewMode> {
    word.parse::<ViewMode>().map_err(|e| anyhow!(e))
}

fn parse_mode(word: &str) -> Result<InputMode> {
    match word.to_ascii_lowercase().as_str() {
        "positive" | "pos" => Ok(InputMode::PositivePoint),
        "negative" | "neg" => Ok(InputMode::NegativePoint),
        "box" => Ok(InputMode::Box),
        other => bail!("unknown input mode '{other}'"),
    }
}

/// `stroke <positive|negative|r,g,b> <size> x,y [x,y ...]`
fn parse_stroke(rest: &[&str]) -> Result<PromptStroke> {
    let [color, size, points @ ..] = rest else {
        bail!("usage: stroke <color> <size> x,y [x,y ...]");
    };

    let color = match *color {
        "positive" | "red" => POSITIVE_STROKE,
        "negative" | "blue" => NEGATIVE_STROKE,
        rgb => {
            let channels: Vec<u8> = rgb
                .split(',')
                .map(|c| c.parse::<u8>())
                .collect::<std::result::Result<_, _>>()
                .with_context(|| format!("'{rgb}' is not an r,g,b colour"))?;
            match channels.as_slice() {
                [r, g, b] => [*r, *g, *b],
                _ => bail!("'{rgb}' is not an r,g,b colour"),
            }
        }
    };

    let brush_size: f32 = size
        .parse()
        .with_context(|| format!("'{size}' is not a brush size"))?;

    let points = points
        .iter()
        .map(|pair| -> Result<(f32, f32)> {
            let (x, y) = pair
                .split_once(',')
                .ok_or_else(|| anyhow!("'{pair}' is not an x,y point"))?;
            Ok((x.parse::<f32>()?, y.parse::<f32>()?))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(PromptStroke::new(points, brush_size, color))
}
