use std::path::Path;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kidney_gradcam::classifier::load_classifier;
use kidney_gradcam::cli::{Args, Command};
use kidney_gradcam::utils::collect_images;
use kidney_gradcam::{AppConfig, InferenceContext, RequestId};

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::filter::LevelFilter::from_level(log_level))
        .init();

    let mut config = AppConfig::load(args.config.as_deref()).context("loading configuration")?;

    match args.command {
        Command::Predict {
            source,
            model,
            layer,
            output,
            request_id,
            no_gradcam,
            cuda,
        } => {
            if let Some(model) = model {
                config.model.path = model;
            }
            if let Some(layer) = layer {
                config.saliency.target_layer = layer;
            }
            if let Some(output) = output {
                config.output_dir = output;
            }
            if no_gradcam {
                config.saliency.enabled = false;
            }
            config.model.cuda |= cuda;
            predict(&config, &source, request_id.as_deref())
        }
        Command::Inspect { model } => {
            if let Some(model) = model {
                config.model.path = model;
            }
            inspect(&config)
        }
    }
}

fn predict(config: &AppConfig, source: &Path, request_id: Option<&str>) -> Result<()> {
    let images = collect_images(source)
        .with_context(|| format!("reading source {}", source.display()))?;
    if images.is_empty() {
        bail!("no jpg/jpeg/png images in {}", source.display());
    }

    let classifier = load_classifier(&config.model)
        .with_context(|| format!("loading model {}", config.model.path.display()))?;
    let context = InferenceContext::new(classifier, config)?;

    let ids = request_ids(request_id, images.len());
    let mut failures = 0usize;
    for (image, id) in images.iter().zip(ids) {
        match context.predict(image, &id) {
            Ok(report) => println!("{}", serde_json::to_string(&report)?),
            Err(e) => {
                failures += 1;
                error!(request_id = %id, image = %image.display(), "prediction failed: {e}");
            }
        }
    }

    info!(total = images.len(), failures, "finished");
    if failures == images.len() {
        bail!("every prediction failed");
    }
    Ok(())
}

/// One id per image. A caller-supplied id is suffixed with the image index
/// when the source holds several images.
fn request_ids(request_id: Option<&str>, count: usize) -> Vec<RequestId> {
    match request_id {
        Some(id) if count == 1 => vec![RequestId::sanitized(id)],
        Some(id) => {
            warn!(count, "suffixing request id with the image index");
            let base = RequestId::sanitized(id);
            (0..count).map(|i| base.with_index(i)).collect()
        }
        None => (0..count).map(|_| RequestId::generate()).collect(),
    }
}

fn inspect(config: &AppConfig) -> Result<()> {
    let classifier = load_classifier(&config.model)
        .with_context(|| format!("loading model {}", config.model.path.display()))?;
    let layers = classifier.layers();
    if layers.is_empty() {
        warn!("model exposes no probe-able layers");
    }
    for layer in layers {
        match layer.shape {
            Some([h, w, c]) => println!("{:<16} {h}x{w}x{c}", layer.name),
            None => println!("{}", layer.name),
        }
    }
    Ok(())
}
