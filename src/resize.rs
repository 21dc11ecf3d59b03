/// Target dimensions computed for one raster image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResizePlan {
    pub width: u32,
    pub height: u32,
    /// False when the target equals the source, so no resampling is needed
    pub resample: bool,
}

/// Map source dimensions and a requested size onto target dimensions.
///
/// A requested dimension of `0` means "unspecified":
/// - neither requested: shrink proportionally so the longer side fits `max_dimension`
/// - one requested: derive the other from the source aspect ratio (truncating)
/// - both requested: use them exactly, even if that distorts the image
pub fn plan(
    source_width: u32,
    source_height: u32,
    requested_width: u32,
    requested_height: u32,
    max_dimension: u32,
) -> ResizePlan {
    let (width, height) = match (requested_width, requested_height) {
        (0, 0) => cap_to(source_width, source_height, max_dimension),
        (w, 0) => (w, scale(w, source_height, source_width)),
        (0, h) => (scale(h, source_width, source_height), h),
        (w, h) => (w, h),
    };

    ResizePlan {
        width,
        height,
        resample: (width, height) != (source_width, source_height),
    }
}

fn cap_to(width: u32, height: u32, max_dimension: u32) -> (u32, u32) {
    if max_dimension == 0 || (width <= max_dimension && height <= max_dimension) {
        return (width, height);
    }
    if width >= height {
        (max_dimension, scale(max_dimension, height, width))
    } else {
        (scale(max_dimension, width, height), max_dimension)
    }
}

/// `value * numerator / denominator`, truncated, never below one pixel
fn scale(value: u32, numerator: u32, denominator: u32) -> u32 {
    let scaled = u64::from(value) * u64::from(numerator) / u64::from(denominator.max(1));
    scaled.clamp(1, u64::from(u32::MAX)) as u32
}
