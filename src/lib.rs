//! Dark Channel Prior haze removal library
//!
//! This library removes atmospheric haze from a single colour photograph by
//! estimating how much scattered light was added to each pixel and inverting
//! the haze imaging model.
//!
//! # Overview
//!
//! A hazy image is modelled as a blend of the true scene radiance `J` and the
//! atmospheric light `A`, weighted by the per-pixel transmission `t`:
//!
//! ```text
//! I(x,y) = J(x,y) × t(x,y) + A × (1 − t(x,y))
//! ```
//!
//! # Pipeline
//!
//! 1. **Dark channel**: for a region, the colour channel holding the smallest
//!    per-pixel minimum anywhere in that region ([`dark_channel_index`]).
//! 2. **Atmospheric light**: a scalar intensity taken from the brightest
//!    candidates in the region's dark channel ([`estimate_atmospheric_light`]).
//! 3. **Transmission**: `t = 1 − v / A`, where `v` is the pixel's value in the
//!    dark channel of a window around it ([`transmission_map`]).
//! 4. **Recovery**: `J = (I − A) / max(t, t0) + A` ([`recover_radiance`]).
//!
//! [`metric::haze_metric`] counts high-frequency pixels of an image and is
//! used to compare the input against the recovered output.
//!
//! # Deviation from the textbook prior
//!
//! The dark channel of a region is a *single channel index* shared by the
//! whole region, not a per-pixel minimum-over-window map. The atmospheric
//! light candidate bucket is filled first-fit rather than holding a true
//! top-K. Both choices are kept because they define the output images.
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use defog::{dehaze, DefogParams};
//!
//! let image = image::open("images/hazy.jpg").unwrap();
//! let result = dehaze(&image, &DefogParams::default()).unwrap();
//! result.save("out.png").unwrap();
//! ```
//!
//! # Value Ranges
//!
//! Intensities stay on the 8-bit scale (0–255) throughout. Transmission and
//! recovered radiance are stored unclamped in `f32` buffers and are only
//! rounded and saturated by [`transmission_to_luma8`] and
//! [`radiance_to_rgb8`] at export time.

use image::{imageops, DynamicImage, GrayImage, ImageBuffer, Luma, Rgb, RgbImage};
use imageproc::map::map_colors;
use log::{debug, trace};
use std::path::{Path, PathBuf};

#[cfg(feature = "rayon")]
use rayon::prelude::*;

pub mod metric;

pub use metric::haze_metric;

/// Half-width of the window used for the per-pixel dark channel lookup.
pub const DEFAULT_WINDOW_HALF_WIDTH: u32 = 10;

/// Lower bound applied to the transmission before dividing by it.
///
/// Tuned empirically by maximising the high-frequency pixel count.
pub const DEFAULT_TRANSMISSION_FLOOR: f64 = 0.54;

/// Fraction of the region kept as atmospheric light candidates (top 0.1%).
pub const DEFAULT_TOP_FRACTION: f64 = 0.001;

/// Per-pixel transmission values, raw and unclamped
pub type TransmissionMap = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Recovered scene radiance on the 0–255 scale, unclamped
pub type RadianceImage = ImageBuffer<Rgb<f32>, Vec<f32>>;

/// Errors that can occur while dehazing
#[derive(Debug, thiserror::Error)]
pub enum DefogError {
    /// The source image could not be read or decoded
    #[error("failed to decode {}: {source}", .path.display())]
    InputDecode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    /// A region was empty or reached outside the image
    #[error("invalid region [{x1}, {x2}) x [{y1}, {y2})")]
    InvalidRegion { x1: u32, y1: u32, x2: u32, y2: u32 },
    /// No atmospheric light candidate could be recorded for a region
    #[error("region of {area} pixels yields no atmospheric light candidates")]
    DegenerateRegion { area: u64 },
    /// Two images of one run do not share their dimensions
    #[error("image dimensions differ: expected {expected:?}, got {actual:?}")]
    DimensionMismatch {
        expected: (u32, u32),
        actual: (u32, u32),
    },
    /// A tuning parameter was out of range
    #[error("{name} out of range, got {value}")]
    InvalidParameter { name: &'static str, value: f64 },
}

/// Result type for dehazing operations
pub type DefogResult<T> = Result<T, DefogError>;

/// Axis-aligned half-open rectangle `[x1, x2) × [y1, y2)`
///
/// A `Region` is never empty: [`Region::new`] rejects zero or negative
/// extents. Whether it fits a particular image is checked by the operations
/// that consume it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    x1: u32,
    y1: u32,
    x2: u32,
    y2: u32,
}

impl Region {
    /// Creates a region, rejecting `x2 <= x1` or `y2 <= y1`.
    pub fn new(x1: u32, y1: u32, x2: u32, y2: u32) -> DefogResult<Self> {
        if x2 <= x1 || y2 <= y1 {
            return Err(DefogError::InvalidRegion { x1, y1, x2, y2 });
        }
        Ok(Self { x1, y1, x2, y2 })
    }

    /// The region covering a whole `width × height` image.
    pub fn full(width: u32, height: u32) -> DefogResult<Self> {
        Self::new(0, 0, width, height)
    }

    /// Number of columns, always at least 1.
    pub fn width(&self) -> u32 {
        self.x2 - self.x1
    }

    /// Number of rows, always at least 1.
    pub fn height(&self) -> u32 {
        self.y2 - self.y1
    }

    /// Number of pixels covered.
    pub fn area(&self) -> u64 {
        u64::from(self.width()) * u64::from(self.height())
    }

    fn check_within(&self, (width, height): (u32, u32)) -> DefogResult<()> {
        if self.x2 > width || self.y2 > height {
            return Err(DefogError::InvalidRegion {
                x1: self.x1,
                y1: self.y1,
                x2: self.x2,
                y2: self.y2,
            });
        }
        Ok(())
    }
}

/// Tuning parameters for one dehazing run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DefogParams {
    /// Half-width of the dark channel window around each pixel
    pub window_half_width: u32,
    /// Floor `t0` applied to the transmission during recovery
    pub transmission_floor: f64,
    /// Fraction of the image used as atmospheric light candidates
    pub top_fraction: f64,
}

impl Default for DefogParams {
    fn default() -> Self {
        Self {
            window_half_width: DEFAULT_WINDOW_HALF_WIDTH,
            transmission_floor: DEFAULT_TRANSMISSION_FLOOR,
            top_fraction: DEFAULT_TOP_FRACTION,
        }
    }
}

impl DefogParams {
    /// Checks every parameter against its valid range.
    ///
    /// # Errors
    ///
    /// Returns [`DefogError::InvalidParameter`] naming the first parameter
    /// that is out of range.
    pub fn validate(&self) -> DefogResult<()> {
        if self.window_half_width == 0 {
            return Err(DefogError::InvalidParameter {
                name: "window half-width",
                value: 0.0,
            });
        }
        if !(self.transmission_floor > 0.0 && self.transmission_floor <= 1.0) {
            return Err(DefogError::InvalidParameter {
                name: "transmission floor",
                value: self.transmission_floor,
            });
        }
        if !(self.top_fraction > 0.0 && self.top_fraction <= 1.0) {
            return Err(DefogError::InvalidParameter {
                name: "top fraction",
                value: self.top_fraction,
            });
        }
        Ok(())
    }
}

/// Output of a dehazing run, including its intermediates
#[derive(Debug, Clone)]
pub struct DefogOutput {
    /// The atmospheric light estimated over the whole image
    pub atmospheric_light: f64,
    /// Raw per-pixel transmission (may fall outside [0, 1])
    pub transmission: TransmissionMap,
    /// Recovered radiance on the 0–255 scale (may fall outside it)
    ///
    /// Use [`radiance_to_rgb8`] to convert to a displayable image
    pub radiance: RadianceImage,
}

/// Opens and decodes an image file
///
/// # Errors
///
/// Returns [`DefogError::InputDecode`] if the file cannot be read or decoded.
pub fn open_image(path: impl AsRef<Path>) -> DefogResult<DynamicImage> {
    let path = path.as_ref();
    image::open(path).map_err(|source| DefogError::InputDecode {
        path: path.to_path_buf(),
        source,
    })
}

/// Index of the smallest value, the lowest index winning ties
///
/// # Panics
///
/// Panics if `values` is empty.
pub fn min_channel<T: PartialOrd + Copy>(values: &[T]) -> usize {
    let mut min = values[0];
    let mut min_index = 0;

    for (index, &value) in values.iter().enumerate().skip(1) {
        if value < min {
            min = value;
            min_index = index;
        }
    }

    min_index
}

/// Finds the dark channel of a region of an image
///
/// Scans the region in row-major order for the pixel with the globally
/// smallest per-pixel minimum and returns the channel that minimum sits in.
/// The first such pixel wins; later pixels replace it only when strictly
/// darker.
///
/// # Arguments
///
/// * `image` - Colour image
/// * `region` - Area to search, which must lie inside the image
///
/// # Returns
///
/// The channel index (0, 1 or 2) of the region's darkest value.
///
/// # Errors
///
/// Returns [`DefogError::InvalidRegion`] if the region reaches outside the image.
pub fn dark_channel_index(image: &RgbImage, region: Region) -> DefogResult<usize> {
    region.check_within(image.dimensions())?;
    Ok(region_dark_channel(image, region))
}

/// Estimates the atmospheric light of a region
///
/// A bucket of `floor(area × top_fraction)` candidate slots is filled while
/// scanning the region: each pixel overwrites the *first* slot whose dark
/// channel value is lower than its own (or equal with a lower grayscale
/// intensity), then the scan moves on. The highest intensity left in the
/// bucket is the estimate.
///
/// # Arguments
///
/// * `image` - Colour image
/// * `gray` - Grayscale version of `image`
/// * `region` - Area to search, usually the whole image
/// * `top_fraction` - Share of the region kept as candidates (e.g. `0.001`)
///
/// # Returns
///
/// The atmospheric light as a grayscale intensity on the 0–255 scale.
///
/// # Errors
///
/// - Returns [`DefogError::DimensionMismatch`] if the two images differ in size
/// - Returns [`DefogError::InvalidRegion`] if the region reaches outside the images
/// - Returns [`DefogError::DegenerateRegion`] if the bucket would be empty
///
/// # Example
///
/// ```rust,no_run
/// use defog::{estimate_atmospheric_light, Region, DEFAULT_TOP_FRACTION};
///
/// let image = image::open("images/hazy.jpg").unwrap();
/// let rgb = image.to_rgb8();
/// let gray = image::imageops::grayscale(&rgb);
/// let region = Region::full(rgb.width(), rgb.height()).unwrap();
/// let light = estimate_atmospheric_light(&rgb, &gray, region, DEFAULT_TOP_FRACTION).unwrap();
/// ```
pub fn estimate_atmospheric_light(
    image: &RgbImage,
    gray: &GrayImage,
    region: Region,
    top_fraction: f64,
) -> DefogResult<f64> {
    if image.dimensions() != gray.dimensions() {
        return Err(DefogError::DimensionMismatch {
            expected: image.dimensions(),
            actual: gray.dimensions(),
        });
    }
    region.check_within(image.dimensions())?;

    let area = region.area();
    let top_num = (area as f64 * top_fraction) as usize;
    if top_num == 0 {
        return Err(DefogError::DegenerateRegion { area });
    }

    let mut bucket = vec![Candidate::UNSET; top_num];
    let dark_channel = region_dark_channel(image, region);
    debug!("dark channel {dark_channel}, {top_num} candidate slots over {area} pixels");

    for y in region.y1..region.y2 {
        for x in region.x1..region.x2 {
            let val = f64::from(image.get_pixel(x, y)[dark_channel]);
            let intensity = f64::from(gray.get_pixel(x, y)[0]);

            let slot = bucket.iter().position(|candidate| {
                candidate.val < val || (candidate.val == val && candidate.intensity < intensity)
            });
            if let Some(index) = slot {
                bucket[index] = Candidate {
                    position: Some((x, y)),
                    val,
                    intensity,
                };
            }
        }
    }

    let mut best: Option<&Candidate> = None;
    for candidate in bucket.iter().filter(|c| c.position.is_some()) {
        if best.map_or(true, |b| candidate.intensity > b.intensity) {
            best = Some(candidate);
        }
    }

    match best {
        Some(candidate) => {
            debug!(
                "atmospheric light {} taken from {:?}",
                candidate.intensity, candidate.position
            );
            Ok(candidate.intensity)
        }
        None => Err(DefogError::DegenerateRegion { area }),
    }
}

/// Window used for the dark channel lookup around `(x, y)`
///
/// The window spans `[x − half, x + half)` horizontally (likewise vertically)
/// and is clipped to the image; a clipped window shrinks rather than being
/// re-centred.
///
/// # Errors
///
/// Returns [`DefogError::InvalidRegion`] if the clipped window is empty,
/// which happens for `half_width == 0` or a pixel outside the image.
pub fn window_region(
    x: u32,
    y: u32,
    half_width: u32,
    width: u32,
    height: u32,
) -> DefogResult<Region> {
    Region::new(
        x.saturating_sub(half_width),
        y.saturating_sub(half_width),
        x.saturating_add(half_width).min(width),
        y.saturating_add(half_width).min(height),
    )
}

/// Transmission of a single pixel: `1 − v / A`
///
/// `v` is this pixel's own value in the dark channel of its window. The
/// result is not clamped and may be negative when `v` exceeds the
/// atmospheric light.
pub fn pixel_transmission(
    image: &RgbImage,
    x: u32,
    y: u32,
    atmospheric_light: f64,
    half_width: u32,
) -> DefogResult<f64> {
    let (width, height) = image.dimensions();
    let window = window_region(x, y, half_width, width, height)?;
    let channel = dark_channel_index(image, window)?;
    let v = f64::from(image.get_pixel(x, y)[channel]);
    Ok(1.0 - v / atmospheric_light)
}

/// Builds the transmission map of an image
///
/// Every pixel is computed independently from the shared image and
/// atmospheric light; with the `rayon` feature rows are processed in
/// parallel.
///
/// # Arguments
///
/// * `image` - Colour image
/// * `atmospheric_light` - Estimate from [`estimate_atmospheric_light`]
/// * `half_width` - Half-width of the dark channel window
///
/// # Errors
///
/// Returns [`DefogError::InvalidRegion`] if `half_width` is zero.
pub fn transmission_map(
    image: &RgbImage,
    atmospheric_light: f64,
    half_width: u32,
) -> DefogResult<TransmissionMap> {
    let (width, height) = image.dimensions();
    let mut map = TransmissionMap::new(width, height);

    #[cfg(feature = "rayon")]
    {
        let rows = (0..height)
            .into_par_iter()
            .map(|y| -> DefogResult<(u32, Vec<f32>)> {
                let mut row = vec![0.0f32; width as usize];
                for x in 0..width {
                    row[x as usize] =
                        pixel_transmission(image, x, y, atmospheric_light, half_width)? as f32;
                }
                Ok((y, row))
            })
            .collect::<DefogResult<Vec<_>>>()?;

        for (y, row) in rows {
            for x in 0..width {
                map.put_pixel(x, y, Luma([row[x as usize]]));
            }
        }
    }

    #[cfg(not(feature = "rayon"))]
    {
        for y in 0..height {
            for x in 0..width {
                let t = pixel_transmission(image, x, y, atmospheric_light, half_width)?;
                map.put_pixel(x, y, Luma([t as f32]));
            }
        }
    }

    Ok(map)
}

/// Inverts the haze model for one channel value
///
/// `(value − A) / max(t, t0) + A`, unclamped. A NaN transmission falls back
/// to the floor.
pub fn recover_channel(value: f64, transmission: f64, atmospheric_light: f64, floor: f64) -> f64 {
    (value - atmospheric_light) / transmission.max(floor) + atmospheric_light
}

/// Recovers the scene radiance of every pixel and channel
///
/// Reads transmission from an `f32` map; [`dehaze_full`] instead feeds the
/// unrounded `f64` transmission straight into [`recover_channel`].
///
/// # Errors
///
/// Returns [`DefogError::DimensionMismatch`] if the map and image differ in size.
pub fn recover_radiance(
    image: &RgbImage,
    transmission: &TransmissionMap,
    atmospheric_light: f64,
    floor: f64,
) -> DefogResult<RadianceImage> {
    if image.dimensions() != transmission.dimensions() {
        return Err(DefogError::DimensionMismatch {
            expected: image.dimensions(),
            actual: transmission.dimensions(),
        });
    }

    let (width, height) = image.dimensions();
    let mut radiance = RadianceImage::new(width, height);

    for (x, y, pixel) in image.enumerate_pixels() {
        let t = f64::from(transmission.get_pixel(x, y)[0]);
        let out = radiance.get_pixel_mut(x, y);
        for channel in 0..3 {
            out.0[channel] =
                recover_channel(f64::from(pixel[channel]), t, atmospheric_light, floor) as f32;
        }
    }

    Ok(radiance)
}

/// Dehazes an image, returning the atmospheric light, transmission map and
/// unclamped radiance
///
/// # Errors
///
/// - Returns [`DefogError::InvalidParameter`] if `params` fail validation
/// - Returns [`DefogError::DegenerateRegion`] if the image is too small to
///   hold a single atmospheric light candidate
pub fn dehaze_full(image: &DynamicImage, params: &DefogParams) -> DefogResult<DefogOutput> {
    dehaze_rgb8_full(&image.to_rgb8(), params)
}

/// Same as [`dehaze_full`] for an image already in 8-bit RGB
pub fn dehaze_rgb8_full(rgb: &RgbImage, params: &DefogParams) -> DefogResult<DefogOutput> {
    params.validate()?;
    debug!("dehazing {}x{} with {params:?}", rgb.width(), rgb.height());

    let gray = imageops::grayscale(rgb);
    let region = Region::full(rgb.width(), rgb.height())?;
    let atmospheric_light = estimate_atmospheric_light(rgb, &gray, region, params.top_fraction)?;

    let (transmission, radiance) = defog_pixels(rgb, atmospheric_light, params)?;
    trace!("transmission map and radiance built");

    Ok(DefogOutput {
        atmospheric_light,
        transmission,
        radiance,
    })
}

/// Dehazes an image into a displayable 8-bit RGB image
///
/// # Errors
///
/// See [`dehaze_full`].
pub fn dehaze(image: &DynamicImage, params: &DefogParams) -> DefogResult<RgbImage> {
    let output = dehaze_full(image, params)?;
    Ok(radiance_to_rgb8(&output.radiance))
}

/// Scales a transmission map by 255 and saturates it to 8 bits
pub fn transmission_to_luma8(map: &TransmissionMap) -> GrayImage {
    map_colors(map, |pixel| Luma([saturate_u8(f64::from(pixel[0]) * 255.0)]))
}

/// Rounds and saturates recovered radiance to 8-bit RGB
pub fn radiance_to_rgb8(radiance: &RadianceImage) -> RgbImage {
    map_colors(radiance, |pixel| {
        Rgb(pixel.0.map(|value| saturate_u8(f64::from(value))))
    })
}

// Internal helper functions

#[derive(Debug, Clone, Copy)]
struct Candidate {
    position: Option<(u32, u32)>,
    val: f64,
    intensity: f64,
}

impl Candidate {
    const UNSET: Self = Self {
        position: None,
        val: -1.0,
        intensity: -1.0,
    };
}

// Transmission stays f64 until it is stored, so recovery sees the exact value.
fn defog_pixel(
    image: &RgbImage,
    x: u32,
    y: u32,
    atmospheric_light: f64,
    params: &DefogParams,
) -> DefogResult<(f32, [f32; 3])> {
    let t = pixel_transmission(image, x, y, atmospheric_light, params.window_half_width)?;
    let pixel = image.get_pixel(x, y);
    let recovered = pixel.0.map(|value| {
        recover_channel(
            f64::from(value),
            t,
            atmospheric_light,
            params.transmission_floor,
        ) as f32
    });
    Ok((t as f32, recovered))
}

fn defog_pixels(
    image: &RgbImage,
    atmospheric_light: f64,
    params: &DefogParams,
) -> DefogResult<(TransmissionMap, RadianceImage)> {
    let (width, height) = image.dimensions();
    let mut transmission = TransmissionMap::new(width, height);
    let mut radiance = RadianceImage::new(width, height);

    #[cfg(feature = "rayon")]
    {
        let rows = (0..height)
            .into_par_iter()
            .map(|y| -> DefogResult<(u32, Vec<(f32, [f32; 3])>)> {
                let row = (0..width)
                    .map(|x| defog_pixel(image, x, y, atmospheric_light, params))
                    .collect::<DefogResult<Vec<_>>>()?;
                Ok((y, row))
            })
            .collect::<DefogResult<Vec<_>>>()?;

        for (y, row) in rows {
            for (x, (t, recovered)) in (0..width).zip(row) {
                transmission.put_pixel(x, y, Luma([t]));
                radiance.put_pixel(x, y, Rgb(recovered));
            }
        }
    }

    #[cfg(not(feature = "rayon"))]
    {
        for y in 0..height {
            for x in 0..width {
                let (t, recovered) = defog_pixel(image, x, y, atmospheric_light, params)?;
                transmission.put_pixel(x, y, Luma([t]));
                radiance.put_pixel(x, y, Rgb(recovered));
            }
        }
    }

    Ok((transmission, radiance))
}

// Caller guarantees the region lies inside the image.
fn region_dark_channel(image: &RgbImage, region: Region) -> usize {
    let first = image.get_pixel(region.x1, region.y1).0;
    let mut min_index = min_channel(&first);
    let mut min_value = first[min_index];

    for y in region.y1..region.y2 {
        for x in region.x1..region.x2 {
            let pixel = image.get_pixel(x, y).0;
            let index = min_channel(&pixel);
            if pixel[index] < min_value {
                min_value = pixel[index];
                min_index = index;
            }
        }
    }

    min_index
}

// NaN saturates to 0
fn saturate_u8(value: f64) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}
