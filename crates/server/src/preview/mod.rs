//! Preview generation.
//!
//! Media files are turned into lightweight previews (JPEG thumbnails for
//! images, short MP4 clips for videos) by an external converter script:
//!
//! ```text
//! <shell> <script> <input> <output> <image|video>
//! ```
//!
//! run in the script's working directory. [`PreviewPipeline`] bounds how
//! many conversions run at once and how many may wait.

pub mod converter;
pub mod pipeline;

pub use converter::{
    preview_output_path, Converter, ConverterScript, MediaKind, PreviewError, PreviewRequest,
};
pub use pipeline::{PipelineOptions, PreviewPipeline, SubmitOutcome};
