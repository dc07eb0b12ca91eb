use clap::Parser;
use defog::{
    dehaze_rgb8_full, haze_metric, open_image, radiance_to_rgb8, transmission_to_luma8,
    DefogParams, DEFAULT_TOP_FRACTION, DEFAULT_TRANSMISSION_FLOOR, DEFAULT_WINDOW_HALF_WIDTH,
};
use log::info;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "defog")]
#[command(about = "Remove haze from a photograph using the dark channel prior", long_about = None)]
struct Cli {
    #[arg(help = "Input image file path")]
    input: PathBuf,

    /// Where to save the transmission map
    #[arg(long, default_value = "map.png")]
    map: PathBuf,

    /// Where to save the dehazed image
    #[arg(short, long, default_value = "out.png")]
    output: PathBuf,

    /// Half-width of the dark channel window
    #[arg(long, default_value_t = DEFAULT_WINDOW_HALF_WIDTH)]
    window_half_width: u32,

    /// Lower bound on the transmission during recovery
    #[arg(long, default_value_t = DEFAULT_TRANSMISSION_FLOOR)]
    floor: f64,

    /// Fraction of pixels considered for the atmospheric light
    #[arg(long, default_value_t = DEFAULT_TOP_FRACTION)]
    top_fraction: f64,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let params = DefogParams {
        window_half_width: cli.window_half_width,
        transmission_floor: cli.floor,
        top_fraction: cli.top_fraction,
    };
    if let Err(err) = params.validate() {
        eprintln!("{err}");
        std::process::exit(1);
    }

    let image = match open_image(&cli.input) {
        Ok(img) => img.to_rgb8(),
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
    };

    println!(
        "Number of high-frequency pixels in the original image: {}",
        haze_metric(&image)
    );

    let output = match dehaze_rgb8_full(&image, &params) {
        Ok(output) => output,
        Err(err) => {
            eprintln!("Processing failed: {err}");
            std::process::exit(1);
        }
    };
    info!("Atmospheric light: {:.1}", output.atmospheric_light);

    let map = transmission_to_luma8(&output.transmission);
    if let Err(err) = map.save(&cli.map) {
        eprintln!("Failed to save {}: {err}", cli.map.display());
        std::process::exit(1);
    }
    info!("Saved transmission map to {}", cli.map.display());

    let defogged = radiance_to_rgb8(&output.radiance);
    println!(
        "Number of high-frequency pixels in the defogged image: {}",
        haze_metric(&defogged)
    );

    if let Err(err) = defogged.save(&cli.output) {
        eprintln!("Failed to save {}: {err}", cli.output.display());
        std::process::exit(1);
    }
    info!("Saved result to {}", cli.output.display());
}
