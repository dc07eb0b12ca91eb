//! High-frequency pixel count used to compare images before and after
//! dehazing.
//!
//! The image is converted to grayscale, transformed with a forward 2D DFT,
//! and the real part of the spectrum is thresholded at 127. More surviving
//! pixels are read as more retained detail, i.e. less haze.

use image::{imageops, GrayImage, ImageBuffer, Luma, RgbImage};
use imageproc::map::map_colors;
use log::trace;
use rustfft::{num_complex::Complex, FftPlanner};

/// Threshold applied to the real part of the spectrum
pub const SPECTRUM_THRESHOLD: f32 = 127.0;

/// Real part of a 2D spectrum, same dimensions as its source
pub type SpectrumImage = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Counts the high-frequency pixels of a colour image
///
/// # Example
///
/// ```rust,no_run
/// use defog::metric::haze_metric;
///
/// let image = image::open("images/hazy.jpg").unwrap().to_rgb8();
/// println!("{}", haze_metric(&image));
/// ```
pub fn haze_metric(image: &RgbImage) -> usize {
    let gray = imageops::grayscale(image);
    let spectrum = dft_real(&gray);
    let binary = threshold(&spectrum, SPECTRUM_THRESHOLD);
    let count = count_nonzero(&binary);
    trace!("{count} high-frequency pixels in {:?}", image.dimensions());
    count
}

/// Real component of the unnormalised forward 2D DFT of a grayscale image
///
/// Rows are transformed first, then columns. Computed in `f64` and stored
/// as `f32`.
pub fn dft_real(gray: &GrayImage) -> SpectrumImage {
    let (width, height) = gray.dimensions();
    let (w, h) = (width as usize, height as usize);
    if w == 0 || h == 0 {
        return SpectrumImage::new(width, height);
    }

    let mut planner = FftPlanner::<f64>::new();

    let mut rows: Vec<Complex<f64>> = gray
        .pixels()
        .map(|p| Complex::new(f64::from(p[0]), 0.0))
        .collect();
    planner.plan_fft_forward(w).process(&mut rows);

    // Column-major copy so every column is contiguous
    let mut columns = vec![Complex::new(0.0, 0.0); w * h];
    for y in 0..h {
        for x in 0..w {
            columns[x * h + y] = rows[y * w + x];
        }
    }
    planner.plan_fft_forward(h).process(&mut columns);

    SpectrumImage::from_fn(width, height, |x, y| {
        Luma([columns[x as usize * h + y as usize].re as f32])
    })
}

/// Binary threshold: values above `thresh` become 255, the rest 0
pub fn threshold(spectrum: &SpectrumImage, thresh: f32) -> GrayImage {
    map_colors(spectrum, |p| Luma([if p[0] > thresh { 255 } else { 0 }]))
}

/// Number of pixels that are not zero
pub fn count_nonzero(image: &GrayImage) -> usize {
    image.pixels().filter(|p| p[0] != 0).count()
}
