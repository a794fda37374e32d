//! Boundary to the image codec. Stages only see the [`Codec`] trait; every error it
//! returns becomes a stage failure.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use image::codecs::gif::{GifDecoder, GifEncoder, Repeat};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType as PngFilter, PngEncoder};
use image::imageops::FilterType;
use image::{AnimationDecoder, DynamicImage, ImageFormat};
use regex::Regex;
use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use crate::error::CodecError;
use crate::preview::{self, PreviewStyle, PREVIEW_QUALITY};
use crate::ImageKind;

/// Image decode/encode/compress and archive operations. Calls are blocking; stages
/// run them on the blocking pool.
pub trait Codec: Send + Sync + 'static {
    fn dimensions(&self, src: &Path) -> Result<(u32, u32), CodecError>;

    /// Writes a copy of `src` scaled to `width`, keeping the aspect ratio.
    fn resize(&self, src: &Path, dst: &Path, width: u32) -> Result<(), CodecError>;

    fn preview(&self, src: &Path, dst: &Path, style: &PreviewStyle) -> Result<(), CodecError>;

    /// Recompresses `src` into `dst`. Never produces a file larger than `src`.
    fn optimize(&self, src: &Path, dst: &Path, kind: Option<ImageKind>) -> Result<(), CodecError>;

    /// Bundles every regular file directly under `dir` into a zip at `dst`.
    fn archive(&self, dir: &Path, dst: &Path) -> Result<(), CodecError>;
}

/// [`Codec`] on top of the `image` and `zip` crates.
#[derive(Debug, Clone)]
pub struct RasterCodec {
    jpeg_quality: u8,
    gif_speed: i32,
}

impl Default for RasterCodec {
    fn default() -> Self {
        Self {
            jpeg_quality: 90,
            gif_speed: 10,
        }
    }
}

impl RasterCodec {
    pub fn new() -> Self {
        Self::default()
    }

    fn encode(&self, img: &DynamicImage, format: ImageFormat, quality: u8) -> Result<Vec<u8>, CodecError> {
        let mut buf = Vec::new();
        match format {
            ImageFormat::Jpeg => {
                let encoder = JpegEncoder::new_with_quality(&mut buf, quality);
                DynamicImage::ImageRgb8(img.to_rgb8()).write_with_encoder(encoder)?;
            }
            ImageFormat::Png => {
                let encoder = PngEncoder::new_with_quality(&mut buf, CompressionType::Best, PngFilter::Adaptive);
                img.write_with_encoder(encoder)?;
            }
            other => {
                img.write_to(&mut io::Cursor::new(&mut buf), other)?;
            }
        }
        Ok(buf)
    }

    /// Re-encodes every frame. The source's loop count carries over; without one the
    /// animation plays once.
    fn reencode_gif(&self, original: &[u8]) -> Result<Vec<u8>, CodecError> {
        let decoder = GifDecoder::new(io::Cursor::new(original))?;
        let frames = decoder.into_frames().collect_frames()?;
        let mut buf = Vec::new();
        {
            let mut encoder = GifEncoder::new_with_speed(&mut buf, self.gif_speed);
            if let Some(repeat) = gif_repeat(original) {
                encoder.set_repeat(repeat)?;
            }
            encoder.encode_frames(frames)?;
        }
        Ok(buf)
    }
}

/// Loop count from the NETSCAPE2.0 application extension, where zero means forever.
fn gif_repeat(bytes: &[u8]) -> Option<Repeat> {
    const NETSCAPE: &[u8] = b"NETSCAPE2.0";
    let at = bytes.windows(NETSCAPE.len()).position(|window| window == NETSCAPE)? + NETSCAPE.len();
    match bytes.get(at..at + 4)? {
        [3, 1, lo, hi] => match u16::from_le_bytes([*lo, *hi]) {
            0 => Some(Repeat::Infinite),
            n => Some(Repeat::Finite(n)),
        },
        _ => None,
    }
}

fn format_of(path: &Path) -> Result<ImageFormat, CodecError> {
    ImageFormat::from_path(path).map_err(CodecError::from)
}

fn write_file(dst: &Path, bytes: &[u8]) -> Result<(), CodecError> {
    let mut out = BufWriter::new(File::create(dst)?);
    out.write_all(bytes)?;
    out.flush()?;
    Ok(())
}

impl Codec for RasterCodec {
    fn dimensions(&self, src: &Path) -> Result<(u32, u32), CodecError> {
        Ok(image::image_dimensions(src)?)
    }

    fn resize(&self, src: &Path, dst: &Path, width: u32) -> Result<(), CodecError> {
        let img = image::open(src)?;
        let height = preview::scaled_height(img.width(), img.height(), width);
        let resized = img.resize_exact(width, height, FilterType::Lanczos3);
        let bytes = self.encode(&resized, format_of(dst)?, self.jpeg_quality)?;
        write_file(dst, &bytes)
    }

    fn preview(&self, src: &Path, dst: &Path, style: &PreviewStyle) -> Result<(), CodecError> {
        let img = image::open(src)?;
        let rendered = preview::render(&img, style);
        let bytes = self.encode(&rendered, format_of(dst)?, PREVIEW_QUALITY)?;
        write_file(dst, &bytes)
    }

    fn optimize(&self, src: &Path, dst: &Path, kind: Option<ImageKind>) -> Result<(), CodecError> {
        let original = fs::read(src)?;
        let optimized = match kind {
            Some(ImageKind::Jpeg) => {
                let img = image::load_from_memory_with_format(&original, ImageFormat::Jpeg)?;
                self.encode(&img, ImageFormat::Jpeg, self.jpeg_quality)?
            }
            Some(ImageKind::Png) => {
                let img = image::load_from_memory_with_format(&original, ImageFormat::Png)?;
                self.encode(&img, ImageFormat::Png, 100)?
            }
            Some(ImageKind::Gif) => self.reencode_gif(&original)?,
            Some(ImageKind::Svg) => {
                let markup = String::from_utf8(original.clone())
                    .map_err(|_| CodecError::Unsupported(format!("{} is not UTF-8 markup", src.display())))?;
                minify_svg(&markup).into_bytes()
            }
            None => original.clone(),
        };

        let kept = if optimized.len() < original.len() {
            &optimized
        } else {
            &original
        };
        debug!(
            file = %src.display(),
            before = original.len(),
            after = kept.len(),
            "optimized"
        );
        write_file(dst, kept)
    }

    fn archive(&self, dir: &Path, dst: &Path) -> Result<(), CodecError> {
        let mut files: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
            .map(|entry| entry.path())
            .collect();
        files.sort();

        let mut zip = ZipWriter::new(File::create(dst)?);
        let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
        for path in &files {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            zip.start_file(name, options)?;
            io::copy(&mut File::open(path)?, &mut zip)?;
        }
        zip.finish()?;
        Ok(())
    }
}

static SVG_COMMENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<!--.*?-->").expect("valid regex"));
static SVG_BETWEEN_TAGS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r">\s+<").expect("valid regex"));
static SVG_WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s{2,}").expect("valid regex"));
static SVG_TEXT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\s*(<text\b.*?</text>)\s*").expect("valid regex"));
static SVG_PRESERVE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"xml:space\s*=\s*["']preserve["']"#).expect("valid regex"));

/// Strips comments and the whitespace between tags. Text content is kept as written,
/// and a document asking for `xml:space="preserve"` only loses its comments.
pub fn minify_svg(markup: &str) -> String {
    let stripped = SVG_COMMENT.replace_all(markup, "");
    if SVG_PRESERVE.is_match(&stripped) {
        return stripped.trim().to_string();
    }

    let squeeze = |markup: &str| -> String {
        let tight = SVG_BETWEEN_TAGS.replace_all(markup, "><");
        SVG_WHITESPACE.replace_all(&tight, " ").into_owned()
    };
    let mut out = String::with_capacity(stripped.len());
    let mut last = 0;
    for text in SVG_TEXT.captures_iter(&stripped) {
        let (Some(whole), Some(element)) = (text.get(0), text.get(1)) else {
            continue;
        };
        out.push_str(&squeeze(&stripped[last..whole.start()]));
        out.push_str(element.as_str());
        last = whole.end();
    }
    out.push_str(&squeeze(&stripped[last..]));
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Frame, Rgb, RgbImage, Rgba, RgbaImage};
    use std::io::Read;
    use tempfile::TempDir;

    fn write_jpeg(path: &Path, w: u32, h: u32) {
        let img = RgbImage::from_fn(w, h, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 60]));
        DynamicImage::ImageRgb8(img).save(path).unwrap();
    }

    #[test]
    fn svg_minification_drops_comments_and_gaps() {
        let markup = "<?xml version=\"1.0\"?>\n<!-- exported -->\n<svg  width=\"10\">\n    <rect  x=\"1\"/>\n</svg>\n";
        assert_eq!(
            minify_svg(markup),
            "<?xml version=\"1.0\"?><svg width=\"10\"><rect x=\"1\"/></svg>"
        );
    }

    #[test]
    fn svg_text_content_is_left_alone() {
        let markup = "<svg>\n  <text x=\"1\">Total:   <tspan>42</tspan> items</text>\n  <g>\n    <rect/>\n  </g>\n</svg>";
        assert_eq!(
            minify_svg(markup),
            "<svg><text x=\"1\">Total:   <tspan>42</tspan> items</text><g><rect/></g></svg>"
        );

        let preserved = "<svg xml:space=\"preserve\">\n  <!-- note -->\n  <desc>a   b</desc>\n</svg>";
        assert_eq!(minify_svg(preserved), "<svg xml:space=\"preserve\">\n  \n  <desc>a   b</desc>\n</svg>");
    }

    fn animation(repeat: Option<Repeat>) -> Vec<u8> {
        let frames = [Rgba([255, 0, 0, 255]), Rgba([0, 0, 255, 255])]
            .map(|pixel| Frame::new(RgbaImage::from_pixel(8, 8, pixel)));
        let mut buf = Vec::new();
        {
            let mut encoder = GifEncoder::new(&mut buf);
            if let Some(repeat) = repeat {
                encoder.set_repeat(repeat).unwrap();
            }
            encoder.encode_frames(frames).unwrap();
        }
        buf
    }

    #[test]
    fn gif_keeps_its_loop_count() {
        let codec = RasterCodec::new();

        let once = codec.reencode_gif(&animation(None)).unwrap();
        assert!(gif_repeat(&once).is_none());

        let thrice = codec.reencode_gif(&animation(Some(Repeat::Finite(3)))).unwrap();
        assert!(matches!(gif_repeat(&thrice), Some(Repeat::Finite(3))));

        let forever = codec.reencode_gif(&animation(Some(Repeat::Infinite))).unwrap();
        assert!(matches!(gif_repeat(&forever), Some(Repeat::Infinite)));
        assert_eq!(
            GifDecoder::new(io::Cursor::new(&forever))
                .unwrap()
                .into_frames()
                .count(),
            2
        );
    }

    #[test]
    fn resize_keeps_aspect_ratio() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("in.jpg");
        let dst = dir.path().join("out.jpg");
        write_jpeg(&src, 1000, 500);

        RasterCodec::new().resize(&src, &dst, 480).unwrap();
        assert_eq!(image::image_dimensions(&dst).unwrap(), (480, 240));
    }

    #[test]
    fn optimize_never_grows_a_file() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("tiny.svg");
        let dst = dir.path().join("out.svg");
        fs::write(&src, "<svg/>").unwrap();

        RasterCodec::new().optimize(&src, &dst, Some(ImageKind::Svg)).unwrap();
        assert_eq!(fs::read(&dst).unwrap(), b"<svg/>");

        let jpg = dir.path().join("photo.jpg");
        let out = dir.path().join("photo-out.jpg");
        write_jpeg(&jpg, 300, 200);
        RasterCodec::new().optimize(&jpg, &out, Some(ImageKind::Jpeg)).unwrap();
        assert!(fs::metadata(&out).unwrap().len() <= fs::metadata(&jpg).unwrap().len());
        assert_eq!(image::image_dimensions(&out).unwrap(), (300, 200));
    }

    #[test]
    fn archive_bundles_top_level_files() {
        let dir = TempDir::new().unwrap();
        let set = dir.path().join("set");
        fs::create_dir(&set).unwrap();
        fs::write(set.join("b.txt"), "bee").unwrap();
        fs::write(set.join("a.txt"), "ay").unwrap();
        fs::create_dir(set.join("nested")).unwrap();
        let dst = dir.path().join("set.zip");

        RasterCodec::new().archive(&set, &dst).unwrap();

        let mut zip = zip::ZipArchive::new(File::open(&dst).unwrap()).unwrap();
        assert_eq!(zip.len(), 2);
        let mut body = String::new();
        zip.by_name("b.txt").unwrap().read_to_string(&mut body).unwrap();
        assert_eq!(body, "bee");
    }

    #[test]
    fn undecodable_input_is_an_error() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("fake.jpg");
        fs::write(&src, b"not a jpeg").unwrap();

        assert!(RasterCodec::new().dimensions(&src).is_err());
        assert!(RasterCodec::new()
            .optimize(&src, &dir.path().join("o.jpg"), Some(ImageKind::Jpeg))
            .is_err());
    }
}
