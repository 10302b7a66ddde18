use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Clone, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file (toml, yaml or json)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Command {
    /// Classify kidney scans and write Grad-CAM overlays
    Predict {
        /// image path, or a directory of images
        #[arg(long, required = true)]
        source: PathBuf,

        /// model path (.mpk burn record or .onnx)
        #[arg(long)]
        model: Option<PathBuf>,

        /// layer probed for Grad-CAM
        #[arg(long)]
        layer: Option<String>,

        /// directory receiving the overlays
        #[arg(long)]
        output: Option<PathBuf>,

        /// request id for a single image; one is generated per image otherwise
        #[arg(long)]
        request_id: Option<String>,

        /// skip the saliency map
        #[arg(long)]
        no_gradcam: bool,

        /// using CUDA EP
        #[arg(long)]
        cuda: bool,
    },
    /// List the layers a model exposes for Grad-CAM
    Inspect {
        #[arg(long)]
        model: Option<PathBuf>,
    },
}
