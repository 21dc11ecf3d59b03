use crate::EmbedMode;
use crate::config::ImageConfig;
use crate::resize;
use crate::scan::ImageReference;
use base64::{Engine, engine::general_purpose::STANDARD};
use image::codecs::gif::GifEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, Frame, ImageFormat};
use log::{debug, trace};
use regex::bytes::Regex as BytesRegex;
use regex::Regex;
use std::fs;
use std::io::Cursor;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;
use ureq::Agent;

pub const MIME_JPEG: &str = "image/jpeg";
pub const MIME_PNG: &str = "image/png";
pub const MIME_GIF: &str = "image/gif";
pub const MIME_SVG: &str = "image/svg+xml";

/// Upper bound on a downloaded body
const MAX_DOWNLOAD_BYTES: u64 = 64 * 1024 * 1024;

/// Upper bound on the pixel count of a resampled image
const MAX_OUTPUT_PIXELS: u64 = 8192 * 8192;

static URL_SCHEME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z][A-Za-z0-9+.-]*://[^/\s?#]+").expect("valid url scheme regex")
});

static SVG_MARKER: LazyLock<BytesRegex> =
    LazyLock::new(|| BytesRegex::new(r"(?i-u)<svg").expect("valid svg marker regex"));

static SVG_ROOT_TAG: LazyLock<BytesRegex> =
    LazyLock::new(|| BytesRegex::new(r"(?i-u)<svg\b[^>]*>").expect("valid svg tag regex"));

static SVG_WIDTH: LazyLock<BytesRegex> = LazyLock::new(|| {
    BytesRegex::new(r#"(?i-u)(\s)width\s*=\s*(?:"[^"]*"|'[^']*')"#).expect("valid svg width regex")
});

static SVG_HEIGHT: LazyLock<BytesRegex> = LazyLock::new(|| {
    BytesRegex::new(r#"(?i-u)(\s)height\s*=\s*(?:"[^"]*"|'[^']*')"#).expect("valid svg height regex")
});

#[derive(Debug)]
pub enum ImageError {
    NotFound(String),
    ReadFailed(String, String),
    FetchFailed(String, String),
    UnsupportedFormat(String),
    TooLarge(String, u32, u32),
    EncodeFailed(String, String),
}

impl std::fmt::Display for ImageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageError::NotFound(path) => write!(f, "Image not found: {}", path),
            ImageError::ReadFailed(path, reason) => {
                write!(f, "Failed to read image '{}': {}", path, reason)
            }
            ImageError::FetchFailed(url, reason) => {
                write!(f, "Failed to fetch image '{}': {}", url, reason)
            }
            ImageError::UnsupportedFormat(locator) => {
                write!(f, "Unsupported image format: {}", locator)
            }
            ImageError::TooLarge(locator, width, height) => {
                write!(f, "Requested size {}x{} is too large for {}", width, height, locator)
            }
            ImageError::EncodeFailed(format, reason) => {
                write!(f, "Failed to encode {}: {}", format, reason)
            }
        }
    }
}

impl std::error::Error for ImageError {}

/// Inline-ready image bytes and the media type they are encoded as
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddedImage {
    pub data: Vec<u8>,
    pub mime_type: String,
}

impl EmbeddedImage {
    pub fn to_data_url(&self) -> String {
        let b64 = STANDARD.encode(&self.data);
        format!("data:{};base64,{}", self.mime_type, b64)
    }

    /// Markdown image tag carrying the data URL
    pub fn to_markdown(&self, alt: &str) -> String {
        format!("![{}]({})", alt, self.to_data_url())
    }
}

/// Absolute `scheme://host...` URL, or a protocol-relative `//host/...` one
pub fn is_remote_url(url: &str) -> bool {
    url.starts_with("//") || URL_SCHEME.is_match(url)
}

pub fn is_data_url(url: &str) -> bool {
    url.starts_with("data:")
}

/// Bytes returned by a network fetch
#[derive(Debug, Clone)]
pub struct FetchedImage {
    pub data: Vec<u8>,
    /// Media type from the `Content-Type` header, parameters stripped
    pub content_type: Option<String>,
}

/// Network access for remote locators
pub trait Fetcher {
    fn fetch(&self, url: &str) -> Result<FetchedImage, ImageError>;
}

/// Blocking HTTP fetcher with a global timeout and browser-like headers
pub struct HttpFetcher {
    agent: Agent,
    user_agent: String,
}

impl HttpFetcher {
    pub fn new(config: &ImageConfig) -> Self {
        let agent: Agent = Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(config.timeout_secs)))
            .build()
            .into();
        Self {
            agent,
            user_agent: config.user_agent.clone(),
        }
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, url: &str) -> Result<FetchedImage, ImageError> {
        let mut response = self
            .agent
            .get(url)
            .header("User-Agent", self.user_agent.as_str())
            .header("Accept", "image/*,*/*;q=0.8")
            .header("Accept-Language", "en-US,en;q=0.9")
            .call()
            .map_err(|e| ImageError::FetchFailed(url.to_string(), e.to_string()))?;

        let status = response.status();
        trace!("HTTP {} for {}", status, url);
        if !status.is_success() {
            return Err(ImageError::FetchFailed(
                url.to_string(),
                format!("HTTP {}", status.as_u16()),
            ));
        }

        let content_type = response
            .headers()
            .get("Content-Type")
            .and_then(|h| h.to_str().ok())
            .map(|s| s.split(';').next().unwrap_or(s).trim().to_string())
            .filter(|s| !s.is_empty());

        let data = response
            .body_mut()
            .with_config()
            .limit(MAX_DOWNLOAD_BYTES)
            .read_to_vec()
            .map_err(|e| ImageError::FetchFailed(url.to_string(), e.to_string()))?;

        trace!("Fetched {} bytes, content-type: {:?}", data.len(), content_type);
        Ok(FetchedImage { data, content_type })
    }
}

/// Raster codecs, in the order decoding is attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RasterFormat {
    Png,
    Jpeg,
    Gif,
    /// Netpbm bitmaps, tried last for anything the common decoders reject
    Pnm,
}

const DECODE_ORDER: [RasterFormat; 4] = [
    RasterFormat::Png,
    RasterFormat::Jpeg,
    RasterFormat::Gif,
    RasterFormat::Pnm,
];

impl RasterFormat {
    fn image_format(self) -> ImageFormat {
        match self {
            RasterFormat::Png => ImageFormat::Png,
            RasterFormat::Jpeg => ImageFormat::Jpeg,
            RasterFormat::Gif => ImageFormat::Gif,
            RasterFormat::Pnm => ImageFormat::Pnm,
        }
    }
}

/// Turns image references into embeddable bytes
pub struct Materializer {
    fetcher: Box<dyn Fetcher>,
    config: ImageConfig,
    embed: EmbedMode,
}

impl Materializer {
    pub fn new(fetcher: Box<dyn Fetcher>, config: ImageConfig, embed: EmbedMode) -> Self {
        Self {
            fetcher,
            config,
            embed,
        }
    }

    /// Materialize one reference, returning Ok(None) when the embed mode excludes it
    pub fn materialize(
        &self,
        reference: &ImageReference,
        base_dir: &Path,
    ) -> Result<Option<EmbeddedImage>, ImageError> {
        let locator = reference.locator.as_str();
        let remote = is_remote_url(locator);

        if !self.embed.allows(remote) {
            trace!("Skipping image (embed {:?}): {}", self.embed, locator);
            return Ok(None);
        }

        let (data, declared) = if remote {
            self.fetch_remote(locator)?
        } else {
            (read_local(locator, base_dir)?, None)
        };

        let embedded = self.convert(reference, &data)?;
        if let Some(declared) = declared.filter(|d| !d.eq_ignore_ascii_case(&embedded.mime_type)) {
            debug!(
                "{} was declared as {} but decodes as {}",
                locator, declared, embedded.mime_type
            );
        }
        Ok(Some(embedded))
    }

    fn convert(
        &self,
        reference: &ImageReference,
        data: &[u8],
    ) -> Result<EmbeddedImage, ImageError> {
        let locator = reference.locator.as_str();

        if is_svg(data) {
            debug!("Treating {} as SVG", locator);
            let data = patch_svg_dimensions(data, reference.width, reference.height);
            return Ok(EmbeddedImage {
                data,
                mime_type: MIME_SVG.to_string(),
            });
        }

        let (img, format) =
            decode_raster(data).ok_or_else(|| ImageError::UnsupportedFormat(locator.to_string()))?;

        let plan = resize::plan(
            img.width(),
            img.height(),
            reference.width,
            reference.height,
            self.config.max_dimension,
        );
        if u64::from(plan.width) * u64::from(plan.height) > MAX_OUTPUT_PIXELS {
            return Err(ImageError::TooLarge(locator.to_string(), plan.width, plan.height));
        }

        let img = if plan.resample {
            debug!(
                "Resizing {} from {}x{} to {}x{}",
                locator,
                img.width(),
                img.height(),
                plan.width,
                plan.height
            );
            img.resize_exact(plan.width, plan.height, FilterType::Triangle)
        } else {
            trace!("Keeping {} at {}x{}", locator, img.width(), img.height());
            img
        };

        encode_raster(&img, format, self.config.quality)
    }

    /// Fetch `url`, returning the body and the media type the response claims
    fn fetch_remote(&self, url: &str) -> Result<(Vec<u8>, Option<String>), ImageError> {
        let url = if url.starts_with("//") {
            format!("https:{}", url)
        } else {
            url.to_string()
        };

        debug!("Fetching remote image: {}", url);
        let fetched = self.fetcher.fetch(&url)?;

        let declared = declared_mime_type(fetched.content_type.as_deref(), &url);
        trace!("Declared type for {}: {}", url, declared);

        Ok((fetched.data, Some(declared)))
    }
}

fn read_local(locator: &str, base_dir: &Path) -> Result<Vec<u8>, ImageError> {
    let path = base_dir.join(locator);
    debug!("Loading local image: {:?}", path);

    let data = fs::read(&path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ImageError::NotFound(path.display().to_string())
        } else {
            ImageError::ReadFailed(path.display().to_string(), e.to_string())
        }
    })?;

    trace!("Loaded {} bytes from {:?}", data.len(), path);
    Ok(data)
}

/// Media type a download claims: the response header, else the URL extension,
/// else JPEG. Only the decoded bytes decide what gets embedded.
fn declared_mime_type(content_type: Option<&str>, url: &str) -> String {
    content_type
        .or_else(|| guess_mime_type_from_path(url))
        .unwrap_or(MIME_JPEG)
        .to_string()
}

/// Best-effort media type from a path or URL extension
fn guess_mime_type_from_path(path: &str) -> Option<&'static str> {
    let path = path.split(['?', '#']).next().unwrap_or(path);
    let ext = Path::new(path).extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some(MIME_PNG),
        "jpg" | "jpeg" => Some(MIME_JPEG),
        "gif" => Some(MIME_GIF),
        "webp" => Some("image/webp"),
        "svg" => Some(MIME_SVG),
        "ico" => Some("image/x-icon"),
        "bmp" => Some("image/bmp"),
        _ => None,
    }
}

fn is_svg(data: &[u8]) -> bool {
    SVG_MARKER.is_match(data)
}

/// Rewrite the root `<svg>` element's existing width/height attributes to the
/// requested values. Unrequested (0) or absent attributes are left alone.
fn patch_svg_dimensions(data: &[u8], width: u32, height: u32) -> Vec<u8> {
    if width == 0 && height == 0 {
        return data.to_vec();
    }
    let Some(tag) = SVG_ROOT_TAG.find(data) else {
        return data.to_vec();
    };

    let mut patched = tag.as_bytes().to_vec();
    if width > 0 {
        let replacement = format!("${{1}}width=\"{}\"", width);
        patched = SVG_WIDTH
            .replace(&patched, replacement.as_bytes())
            .into_owned();
    }
    if height > 0 {
        let replacement = format!("${{1}}height=\"{}\"", height);
        patched = SVG_HEIGHT
            .replace(&patched, replacement.as_bytes())
            .into_owned();
    }

    let mut out = Vec::with_capacity(data.len() + 8);
    out.extend_from_slice(&data[..tag.start()]);
    out.extend_from_slice(&patched);
    out.extend_from_slice(&data[tag.end()..]);
    out
}

fn decode_raster(data: &[u8]) -> Option<(DynamicImage, RasterFormat)> {
    DECODE_ORDER.into_iter().find_map(|format| {
        match image::load_from_memory_with_format(data, format.image_format()) {
            Ok(img) => {
                trace!("Decoded as {:?}: {}x{}", format, img.width(), img.height());
                Some((img, format))
            }
            Err(e) => {
                trace!("Not {:?}: {}", format, e);
                None
            }
        }
    })
}

/// PNG and GIF keep their format; everything else becomes JPEG
fn encode_raster(
    img: &DynamicImage,
    format: RasterFormat,
    quality: u8,
) -> Result<EmbeddedImage, ImageError> {
    let mut data = Vec::new();
    let mime_type = match format {
        RasterFormat::Png => {
            img.write_to(&mut Cursor::new(&mut data), ImageFormat::Png)
                .map_err(|e| ImageError::EncodeFailed("PNG".to_string(), e.to_string()))?;
            MIME_PNG
        }
        RasterFormat::Gif => {
            let mut encoder = GifEncoder::new(&mut data);
            encoder
                .encode_frame(Frame::new(img.to_rgba8()))
                .map_err(|e| ImageError::EncodeFailed("GIF".to_string(), e.to_string()))?;
            // The trailer is written when the encoder is dropped
            drop(encoder);
            MIME_GIF
        }
        RasterFormat::Jpeg | RasterFormat::Pnm => {
            JpegEncoder::new_with_quality(&mut data, quality)
                .encode_image(&img.to_rgb8())
                .map_err(|e| ImageError::EncodeFailed("JPEG".to_string(), e.to_string()))?;
            MIME_JPEG
        }
    };

    trace!("Encoded {} bytes as {}", data.len(), mime_type);
    Ok(EmbeddedImage {
        data,
        mime_type: mime_type.to_string(),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::scan::SourceKind;
    use image::{Rgb, RgbImage, Rgba, RgbaImage};
    use std::collections::HashMap;
    use tempfile::TempDir;

    pub(crate) const SVG: &str = r#"<svg width="100" height="100"><circle cx="50" cy="50" r="40" stroke="green" stroke-width="4" fill="yellow" /></svg>"#;

    pub(crate) fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb([20, 40, 60]));
        let mut data = Vec::new();
        JpegEncoder::new(&mut data).encode_image(&img).unwrap();
        data
    }

    pub(crate) fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = RgbaImage::from_pixel(width, height, Rgba([255, 0, 0, 128]));
        let mut data = Vec::new();
        DynamicImage::ImageRgba8(img)
            .write_to(&mut Cursor::new(&mut data), ImageFormat::Png)
            .unwrap();
        data
    }

    fn gif_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = RgbaImage::from_pixel(width, height, Rgba([0, 0, 255, 255]));
        let mut data = Vec::new();
        {
            let mut encoder = GifEncoder::new(&mut data);
            encoder.encode_frame(Frame::new(img)).unwrap();
        }
        data
    }

    fn ppm_bytes(width: u32, height: u32) -> Vec<u8> {
        let mut data = format!("P6\n{} {}\n255\n", width, height).into_bytes();
        data.extend(std::iter::repeat_n([10u8, 200, 30], (width * height) as usize).flatten());
        data
    }

    /// Serves canned responses; anything else fails like a 404
    #[derive(Default)]
    pub(crate) struct StubFetcher {
        responses: HashMap<String, FetchedImage>,
    }

    impl StubFetcher {
        pub(crate) fn with(mut self, url: &str, data: Vec<u8>, content_type: Option<&str>) -> Self {
            self.responses.insert(
                url.to_string(),
                FetchedImage {
                    data,
                    content_type: content_type.map(str::to_string),
                },
            );
            self
        }
    }

    impl Fetcher for StubFetcher {
        fn fetch(&self, url: &str) -> Result<FetchedImage, ImageError> {
            self.responses
                .get(url)
                .cloned()
                .ok_or_else(|| ImageError::FetchFailed(url.to_string(), "HTTP 404".to_string()))
        }
    }

    fn reference(locator: &str, width: u32, height: u32) -> ImageReference {
        ImageReference {
            raw: format!("![img]({})", locator),
            alt: "img".to_string(),
            locator: locator.to_string(),
            start: 0,
            end: 0,
            width,
            height,
            kind: SourceKind::Markdown,
        }
    }

    fn materializer(fetcher: StubFetcher, embed: EmbedMode) -> Materializer {
        Materializer::new(Box::new(fetcher), ImageConfig::default(), embed)
    }

    fn decode(img: &EmbeddedImage) -> DynamicImage {
        image::load_from_memory(&img.data).unwrap()
    }

    #[test]
    fn test_is_remote_url() {
        assert!(is_remote_url("http://example.com/image.png"));
        assert!(is_remote_url("https://example.com/image.png"));
        assert!(is_remote_url("//example.com/image.png"));
        assert!(is_remote_url("ftp://files.example.com/a.png"));
        assert!(!is_remote_url("image.png"));
        assert!(!is_remote_url("./images/photo.jpg"));
        assert!(!is_remote_url("/absolute/path/image.png"));
        assert!(!is_remote_url("https://"));
        assert!(!is_remote_url("data:image/png;base64,AAAA"));
    }

    #[test]
    fn test_is_data_url() {
        assert!(is_data_url("data:image/png;base64,iVBORw0KGgo="));
        assert!(!is_data_url("http://example.com"));
        assert!(!is_data_url("image.png"));
    }

    #[test]
    fn test_embedded_image_to_data_url() {
        let img = EmbeddedImage {
            data: vec![1, 2, 3, 4],
            mime_type: MIME_PNG.to_string(),
        };
        assert_eq!(img.to_data_url(), "data:image/png;base64,AQIDBA==");
        assert_eq!(img.to_markdown("x"), "![x](data:image/png;base64,AQIDBA==)");
    }

    #[test]
    fn test_guess_mime_type_from_path() {
        assert_eq!(guess_mime_type_from_path("a/photo.JPG"), Some(MIME_JPEG));
        assert_eq!(guess_mime_type_from_path("https://x.io/i.png?w=2"), Some(MIME_PNG));
        assert_eq!(guess_mime_type_from_path("icon.svg#frag"), Some(MIME_SVG));
        assert_eq!(guess_mime_type_from_path("noext"), None);
    }

    #[test]
    fn test_image_error_display() {
        let err = ImageError::NotFound("/path/to/image.png".to_string());
        assert_eq!(err.to_string(), "Image not found: /path/to/image.png");

        let err = ImageError::FetchFailed("http://example.com".to_string(), "timeout".to_string());
        assert_eq!(
            err.to_string(),
            "Failed to fetch image 'http://example.com': timeout"
        );

        let err = ImageError::UnsupportedFormat("notes.txt".to_string());
        assert_eq!(err.to_string(), "Unsupported image format: notes.txt");

        let err = ImageError::TooLarge("big.png".to_string(), 9000, 9000);
        assert_eq!(err.to_string(), "Requested size 9000x9000 is too large for big.png");

        let err = ImageError::EncodeFailed("JPEG".to_string(), "bad".to_string());
        assert_eq!(err.to_string(), "Failed to encode JPEG: bad");
    }

    #[test]
    fn test_svg_detection_is_case_insensitive() {
        assert!(is_svg(b"<?xml version=\"1.0\"?>\n<SVG xmlns=\"...\"></SVG>"));
        assert!(!is_svg(&png_bytes(1, 1)));
    }

    #[test]
    fn test_patch_svg_width_only() {
        let patched = patch_svg_dimensions(SVG.as_bytes(), 200, 0);
        let text = String::from_utf8(patched).unwrap();
        assert!(text.contains(r#"<svg width="200" height="100">"#));
        assert!(text.contains(r#"stroke-width="4""#));
    }

    #[test]
    fn test_patch_svg_both_dimensions() {
        let patched = patch_svg_dimensions(SVG.as_bytes(), 30, 40);
        let text = String::from_utf8(patched).unwrap();
        assert!(text.starts_with(r#"<svg width="30" height="40">"#));
    }

    #[test]
    fn test_patch_svg_never_inserts_attributes() {
        let svg = br#"<svg viewBox="0 0 10 10"><rect width="5" height="5"/></svg>"#;
        assert_eq!(patch_svg_dimensions(svg, 50, 50), svg.to_vec());
    }

    #[test]
    fn test_patch_svg_no_request_is_verbatim() {
        assert_eq!(patch_svg_dimensions(SVG.as_bytes(), 0, 0), SVG.as_bytes());
    }

    #[test]
    fn test_decode_order_and_fallback() {
        assert_eq!(decode_raster(&png_bytes(2, 2)).unwrap().1, RasterFormat::Png);
        assert_eq!(decode_raster(&jpeg_bytes(2, 2)).unwrap().1, RasterFormat::Jpeg);
        assert_eq!(decode_raster(&gif_bytes(2, 2)).unwrap().1, RasterFormat::Gif);
        assert_eq!(decode_raster(&ppm_bytes(2, 2)).unwrap().1, RasterFormat::Pnm);
        assert!(decode_raster(b"definitely not an image").is_none());
    }

    #[test]
    fn test_materialize_local_jpeg_small_not_resized() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("test.jpg"), jpeg_bytes(4, 3)).unwrap();

        let m = materializer(StubFetcher::default(), EmbedMode::All);
        let img = m
            .materialize(&reference("test.jpg", 0, 0), temp_dir.path())
            .unwrap()
            .unwrap();
        assert_eq!(img.mime_type, MIME_JPEG);
        let decoded = decode(&img);
        assert_eq!((decoded.width(), decoded.height()), (4, 3));
    }

    #[test]
    fn test_materialize_png_keeps_format_and_resizes() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("wide.png"), png_bytes(80, 40)).unwrap();

        let m = materializer(StubFetcher::default(), EmbedMode::All);
        let img = m
            .materialize(&reference("wide.png", 20, 0), temp_dir.path())
            .unwrap()
            .unwrap();
        assert_eq!(img.mime_type, MIME_PNG);
        let decoded = decode(&img);
        assert_eq!((decoded.width(), decoded.height()), (20, 10));
    }

    #[test]
    fn test_materialize_default_cap() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("big.jpg"), jpeg_bytes(800, 400)).unwrap();

        let m = materializer(StubFetcher::default(), EmbedMode::All);
        let img = m
            .materialize(&reference("big.jpg", 0, 0), temp_dir.path())
            .unwrap()
            .unwrap();
        let decoded = decode(&img);
        assert_eq!((decoded.width(), decoded.height()), (200, 100));
    }

    #[test]
    fn test_materialize_gif_stays_gif() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("anim.gif"), gif_bytes(10, 10)).unwrap();

        let m = materializer(StubFetcher::default(), EmbedMode::All);
        let img = m
            .materialize(&reference("anim.gif", 5, 5), temp_dir.path())
            .unwrap()
            .unwrap();
        assert_eq!(img.mime_type, MIME_GIF);
        assert_eq!(decode(&img).width(), 5);
    }

    #[test]
    fn test_materialize_ppm_becomes_jpeg() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("raw.ppm"), ppm_bytes(6, 4)).unwrap();

        let m = materializer(StubFetcher::default(), EmbedMode::All);
        let img = m
            .materialize(&reference("raw.ppm", 0, 0), temp_dir.path())
            .unwrap()
            .unwrap();
        assert_eq!(img.mime_type, MIME_JPEG);
        assert_eq!(image::guess_format(&img.data).unwrap(), ImageFormat::Jpeg);
    }

    #[test]
    fn test_materialize_svg_patched_verbatim_otherwise() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("test.svg"), SVG).unwrap();

        let m = materializer(StubFetcher::default(), EmbedMode::All);
        let img = m
            .materialize(&reference("test.svg", 200, 0), temp_dir.path())
            .unwrap()
            .unwrap();
        assert_eq!(img.mime_type, MIME_SVG);
        let text = String::from_utf8(img.data).unwrap();
        assert!(text.contains(r#"width="200""#));
        assert!(text.contains(r#"height="100""#));
    }

    #[test]
    fn test_materialize_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let m = materializer(StubFetcher::default(), EmbedMode::All);
        let result = m.materialize(&reference("missing.jpg", 0, 0), temp_dir.path());
        assert!(matches!(result, Err(ImageError::NotFound(_))));
    }

    #[test]
    fn test_materialize_oversized_request_fails() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("test.jpg"), jpeg_bytes(1, 1)).unwrap();

        let m = materializer(StubFetcher::default(), EmbedMode::All);
        let result = m.materialize(&reference("test.jpg", u32::MAX, u32::MAX), temp_dir.path());
        assert!(matches!(result, Err(ImageError::TooLarge(_, w, h)) if w == u32::MAX && h == u32::MAX));

        // One side is enough when the aspect ratio derives a huge other side
        let result = m.materialize(&reference("test.jpg", 0, 100_000), temp_dir.path());
        assert!(matches!(result, Err(ImageError::TooLarge(_, _, _))));
    }

    #[test]
    fn test_materialize_oversized_svg_is_only_patched() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("test.svg"), SVG).unwrap();

        let m = materializer(StubFetcher::default(), EmbedMode::All);
        let img = m
            .materialize(&reference("test.svg", u32::MAX, 0), temp_dir.path())
            .unwrap()
            .unwrap();
        let text = String::from_utf8(img.data).unwrap();
        assert!(text.contains(&format!("width=\"{}\"", u32::MAX)));
    }

    #[test]
    fn test_declared_mime_type() {
        let url = "https://example.com/a.png";
        assert_eq!(declared_mime_type(Some(MIME_GIF), url), MIME_GIF);
        assert_eq!(declared_mime_type(None, url), MIME_PNG);
        assert_eq!(declared_mime_type(None, "https://example.com/raw"), MIME_JPEG);
    }

    #[test]
    fn test_materialize_unsupported_format() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("notes.png"), "just text").unwrap();

        let m = materializer(StubFetcher::default(), EmbedMode::All);
        let result = m.materialize(&reference("notes.png", 0, 0), temp_dir.path());
        assert!(matches!(result, Err(ImageError::UnsupportedFormat(_))));
    }

    #[test]
    fn test_materialize_remote_classifies_actual_bytes() {
        let url = "https://example.com/photo.png";
        let fetcher = StubFetcher::default().with(url, jpeg_bytes(2, 2), Some(MIME_PNG));
        let m = materializer(fetcher, EmbedMode::All);

        let img = m
            .materialize(&reference(url, 0, 0), Path::new("."))
            .unwrap()
            .unwrap();
        assert_eq!(img.mime_type, MIME_JPEG);
    }

    #[test]
    fn test_materialize_remote_svg() {
        let url = "https://example.com/test.svg";
        let fetcher = StubFetcher::default().with(url, SVG.as_bytes().to_vec(), None);
        let m = materializer(fetcher, EmbedMode::All);

        let img = m
            .materialize(&reference(url, 0, 0), Path::new("."))
            .unwrap()
            .unwrap();
        assert_eq!(img.mime_type, MIME_SVG);
        assert_eq!(img.data, SVG.as_bytes());
    }

    #[test]
    fn test_materialize_protocol_relative_uses_https() {
        let fetcher =
            StubFetcher::default().with("https://cdn.example.com/a.jpg", jpeg_bytes(1, 1), None);
        let m = materializer(fetcher, EmbedMode::All);

        let img = m.materialize(&reference("//cdn.example.com/a.jpg", 0, 0), Path::new("."));
        assert!(img.unwrap().is_some());
    }

    #[test]
    fn test_materialize_fetch_failure() {
        let m = materializer(StubFetcher::default(), EmbedMode::All);
        let result = m.materialize(&reference("https://example.com/gone.jpg", 0, 0), Path::new("."));
        assert!(matches!(result, Err(ImageError::FetchFailed(_, _))));
    }

    #[test]
    fn test_materialize_respects_embed_mode() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("test.jpg"), jpeg_bytes(1, 1)).unwrap();
        let url = "https://example.com/a.jpg";

        let local_only = materializer(
            StubFetcher::default().with(url, jpeg_bytes(1, 1), None),
            EmbedMode::Local,
        );
        assert!(local_only
            .materialize(&reference(url, 0, 0), temp_dir.path())
            .unwrap()
            .is_none());
        assert!(local_only
            .materialize(&reference("test.jpg", 0, 0), temp_dir.path())
            .unwrap()
            .is_some());

        let none = materializer(StubFetcher::default(), EmbedMode::None);
        assert!(none
            .materialize(&reference("test.jpg", 0, 0), temp_dir.path())
            .unwrap()
            .is_none());

        let remote_only = materializer(StubFetcher::default(), EmbedMode::Remote);
        assert!(remote_only
            .materialize(&reference("test.jpg", 0, 0), temp_dir.path())
            .unwrap()
            .is_none());
    }
}
