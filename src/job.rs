use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{StageFault, ValidationFault};
use crate::store::ContentStore;
use crate::JobTicket;

const ID_LEN: usize = 12;
const ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Opaque, URL-safe job identifier. Also the directory name of every artifact of the job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn generate<R: Rng>(rng: &mut R) -> Self {
        let id = (0..ID_LEN)
            .map(|_| ID_ALPHABET[rng.random_range(0..ID_ALPHABET.len())] as char)
            .collect();
        JobId(id)
    }

    /// Accepts ids coming from outside (status, download, delete). Only lowercase
    /// alphanumerics pass, so an id can never escape the store roots.
    pub fn parse(raw: &str) -> Result<Self, ValidationFault> {
        let valid = !raw.is_empty()
            && raw.len() <= 64
            && raw
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit());
        if valid {
            Ok(JobId(raw.to_string()))
        } else {
            Err(ValidationFault::MalformedId(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Target widths an upload may be resized to. Declaration order is ascending width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeClass {
    XSmall,
    Small,
    Medium,
    Large,
    Retina,
}

impl SizeClass {
    pub const ALL: [SizeClass; 5] = [
        SizeClass::XSmall,
        SizeClass::Small,
        SizeClass::Medium,
        SizeClass::Large,
        SizeClass::Retina,
    ];

    pub fn width(self) -> u32 {
        match self {
            SizeClass::XSmall => 320,
            SizeClass::Small => 480,
            SizeClass::Medium => 960,
            SizeClass::Large => 1280,
            SizeClass::Retina => 2560,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            SizeClass::XSmall => "xsmall",
            SizeClass::Small => "small",
            SizeClass::Medium => "medium",
            SizeClass::Large => "large",
            SizeClass::Retina => "retina",
        }
    }
}

impl FromStr for SizeClass {
    type Err = ValidationFault;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        SizeClass::ALL
            .into_iter()
            .find(|class| class.label() == wanted)
            .ok_or_else(|| ValidationFault::UnknownSizeClass(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreviewMode {
    #[default]
    None,
    Blur,
    Pixelate,
    Tessellate,
}

impl FromStr for PreviewMode {
    type Err = ValidationFault;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(PreviewMode::None),
            "blur" => Ok(PreviewMode::Blur),
            "pix" | "pixelate" | "pixellate" => Ok(PreviewMode::Pixelate),
            "tri" | "tessellate" => Ok(PreviewMode::Tessellate),
            _ => Err(ValidationFault::UnknownPreviewMode(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageKind {
    Jpeg,
    Png,
    Gif,
    Svg,
}

/// Decides which stages apply. Vector and animated sources are neither resized nor previewed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MimeClass {
    Raster,
    Vector,
    Animated,
}

impl ImageKind {
    /// `ext` may carry its leading dot; matching ignores case.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.trim_start_matches('.').to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Some(ImageKind::Jpeg),
            "png" => Some(ImageKind::Png),
            "gif" => Some(ImageKind::Gif),
            "svg" => Some(ImageKind::Svg),
            _ => None,
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(ImageKind::from_extension)
    }

    pub fn mime_class(self) -> MimeClass {
        match self {
            ImageKind::Jpeg | ImageKind::Png => MimeClass::Raster,
            ImageKind::Gif => MimeClass::Animated,
            ImageKind::Svg => MimeClass::Vector,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageError {
    pub stage: &'static str,
    pub cause: String,
}

impl From<&StageFault> for StageError {
    fn from(fault: &StageFault) -> Self {
        StageError {
            stage: fault.stage,
            cause: fault.cause.to_string(),
        }
    }
}

/// The unit of work threaded through the stage chain.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub id: JobId,
    pub base_name: String,
    pub extension: String,
    pub kind: ImageKind,
    pub mime_class: MimeClass,
    pub source_file: PathBuf,
    pub requested_variants: BTreeSet<SizeClass>,
    pub preview: PreviewMode,
    pub working_dir: PathBuf,
    pub publish_dir: PathBuf,
    pub source_width: Option<u32>,
    /// Names of the stages that ran, in order.
    pub trail: Vec<&'static str>,
    pub stage_errors: Vec<StageError>,
}

impl JobContext {
    pub fn from_ticket(ticket: JobTicket, store: &ContentStore) -> Self {
        let working_dir = store.working_dir(&ticket.id);
        let publish_dir = store.publish_dir(&ticket.id);
        let source_file = working_dir.join(ticket.original_file_name());

        JobContext {
            mime_class: ticket.kind.mime_class(),
            kind: ticket.kind,
            id: ticket.id,
            base_name: ticket.base_name,
            extension: ticket.extension,
            source_file,
            requested_variants: ticket.variants,
            preview: ticket.preview,
            working_dir,
            publish_dir,
            source_width: None,
            trail: Vec::new(),
            stage_errors: Vec::new(),
        }
    }

    pub fn variant_file_name(&self, class: SizeClass) -> String {
        format!("{}-{}{}", self.base_name, class.label(), self.extension)
    }

    pub fn preview_file_name(&self) -> String {
        format!("{}-async{}", self.base_name, self.extension)
    }

    pub fn original_file_name(&self) -> String {
        format!("{}-original{}", self.base_name, self.extension)
    }

    pub fn is_failed(&self) -> bool {
        !self.stage_errors.is_empty()
    }

    pub fn failure_summary(&self) -> String {
        self.stage_errors
            .iter()
            .map(|err| format!("{}: {}", err.stage, err.cause))
            .collect::<Vec<_>>()
            .join("; ")
    }
}
