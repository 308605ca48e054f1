//! vuml: inspect GPUs, self-test a device, render the Mandelbrot demo.

mod ppm;

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use bytemuck::{Pod, Zeroable};
use clap::{Parser, Subcommand};
use vuml::{
    div_up, BufferArray, Device, DeviceArray, DeviceSelection, HostArray, Instance, LogLevel,
    LogSink, Logger, MemoryTier, Program, VumlConfig,
};

#[derive(Parser, Debug)]
#[command(name = "vuml", version, about = "Vulkan compute arrays and kernels")]
struct Cli {
    /// JSON config file (log, device, instance sections)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// trace, debug, info, warn, error or off
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Append log output to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List physical devices and their compute limits
    Devices {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Round-trip data through every array kind on a device
    Check {
        /// Device index (default: selection from config)
        #[arg(long)]
        device: Option<usize>,

        /// Elements per test array
        #[arg(long, default_value = "4096")]
        len: usize,
    },

    /// Render the Mandelbrot set with a compute kernel
    Mandelbrot {
        /// Compiled SPIR-V of shaders/mandelbrot.comp
        #[arg(long)]
        kernel: PathBuf,

        #[arg(long, default_value = "320")]
        width: u32,

        #[arg(long, default_value = "240")]
        height: u32,

        #[arg(short, long, default_value = "mandelbrot.ppm")]
        output: PathBuf,

        /// Device index (default: selection from config)
        #[arg(long)]
        device: Option<usize>,
    },
}

/// Push-constant block of `shaders/mandelbrot.comp`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
struct MandelbrotParams {
    width: u32,
    height: u32,
}

/// Work-group edge, baked into the kernel as specialization constants 0 and 1.
const WORKGROUP: u32 = 32;

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let logger = Logger::new(&config.log).context("failed to set up logging")?;

    match cli.command {
        Commands::Devices { json } => cmd_devices(&config, logger, json),
        Commands::Check { device, len } => {
            let device = open_device(&config, logger, device)?;
            cmd_check(&device, len)
        }
        Commands::Mandelbrot { kernel, width, height, output, device } => {
            let device = open_device(&config, logger, device)?;
            cmd_mandelbrot(&device, &kernel, width, height, &output)
        }
    }
}

/// Config file (if any) with command-line overrides applied.
fn load_config(cli: &Cli) -> Result<VumlConfig> {
    let mut config = match &cli.config {
        Some(path) => VumlConfig::from_json(path)?,
        None => VumlConfig::default(),
    };
    if let Some(level) = &cli.log_level {
        config.log.level = level.parse::<LogLevel>()?;
    }
    if let Some(path) = &cli.log_file {
        config.log.sink = LogSink::File(path.clone());
    }
    config.validate()?;
    Ok(config)
}

fn open_device(config: &VumlConfig, logger: Logger, index: Option<usize>) -> Result<Device> {
    let instance = Instance::new(&config.instance, logger)?;
    let selection = index.map_or(config.device, DeviceSelection::Index);
    let device = instance.select(&selection)?;
    eprintln!("using {} ({})", device.name(), device.info().kind);
    Ok(device)
}

fn cmd_devices(config: &VumlConfig, logger: Logger, json: bool) -> Result<()> {
    let instance = Instance::new(&config.instance, logger)?;
    let infos = instance.physical_devices();
    if json {
        println!("{}", serde_json::to_string_pretty(infos)?);
        return Ok(());
    }
    for (i, info) in infos.iter().enumerate() {
        let l = &info.limits;
        println!("[{i}] {} ({}, Vulkan {}.{})", info.name, info.kind, info.api_version_major, info.api_version_minor);
        println!(
            "    work groups: count {:?}, size {:?}, invocations {}",
            l.max_compute_work_group_count, l.max_compute_work_group_size, l.max_compute_work_group_invocations
        );
        println!(
            "    shared memory {} B, storage range {} B, push constants {} B, f16 {}, int64 {}",
            l.max_compute_shared_memory_size,
            l.max_storage_buffer_range,
            l.max_push_constants_size,
            info.supports_f16,
            info.supports_int64
        );
    }
    Ok(())
}

/// Upload, device-to-device copy and download through each array kind,
/// checking the data survives every hop.
fn cmd_check(device: &Device, len: usize) -> Result<()> {
    let start = Instant::now();
    let expected: Vec<u32> = (0..len as u32).map(|i| i.wrapping_mul(2_654_435_761)).collect();

    let host = HostArray::from_slice(device, &expected, MemoryTier::HostCoherent)?;
    let mut mirrored = DeviceArray::<u32>::new(device, len)?;
    mirrored.from_host(&host[..])?;
    let scratch = DeviceArray::<u32>::with_tier(device, len, MemoryTier::DeviceOnly)?;
    vuml::copy(mirrored.begin().until(mirrored.end()), scratch.begin())?;

    let back = scratch.to_vec()?;
    if let Some(i) = (0..len).find(|&i| back[i] != expected[i]) {
        bail!("mismatch at element {i}: expected {}, got {}", expected[i], back[i]);
    }
    let half = len / 2;
    let tail = mirrored.range_to_vec(half, len)?;
    if tail != expected[half..] {
        bail!("range download differs from upload");
    }
    device.logger().scope(|| tracing::info!(len, device = %device.name(), "self-test passed"));

    println!(
        "ok: {len} elements via {} / {} / {} memory in {:.2?}",
        host.tier(),
        mirrored.tier(),
        scratch.tier(),
        start.elapsed()
    );
    Ok(())
}

/// Dispatch the kernel in `code` over a `width` x `height` image and read it back.
fn render_mandelbrot(device: &Device, code: &[u32], width: u32, height: u32) -> Result<Vec<[f32; 4]>> {
    let image = DeviceArray::<[f32; 4]>::with_tier(device, width as usize * height as usize, MemoryTier::DeviceOnly)?;
    let mut program = Program::<(u32, u32), MandelbrotParams>::new(device, code)?;
    program
        .grid(div_up(width, WORKGROUP), div_up(height, WORKGROUP), 1)
        .spec((WORKGROUP, WORKGROUP))
        .run(&MandelbrotParams { width, height }, &[&image])?;
    Ok(image.to_vec()?)
}

fn cmd_mandelbrot(device: &Device, kernel: &Path, width: u32, height: u32, output: &Path) -> Result<()> {
    if width == 0 || height == 0 {
        bail!("image size must be non-zero, got {width}x{height}");
    }
    let code = vuml::read_spirv(kernel)?;
    let start = Instant::now();
    let pixels = render_mandelbrot(device, &code, width, height)?;
    let elapsed = start.elapsed();
    device.logger().scope(|| {
        tracing::info!(width, height, elapsed_us = elapsed.as_micros() as u64, "mandelbrot rendered")
    });
    ppm::write_ppm(output, width, height, &pixels)?;
    println!("{width}x{height} rendered in {elapsed:.2?}, written to {}", output.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vuml::mock::MockDriver;

    const MANDELBROT: &[u32] = &[0x0723_0203, 0x0001_0000, 7];

    fn device(mock: &MockDriver) -> Device {
        Device::new(mock.clone(), Logger::disabled()).unwrap()
    }

    #[test]
    fn test_parse_global_flags() {
        let cli = Cli::try_parse_from(["vuml", "check", "--log-level", "debug", "--len", "16"]).unwrap();
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert!(matches!(cli.command, Commands::Check { device: None, len: 16 }));
    }

    #[test]
    fn test_mandelbrot_defaults() {
        let cli = Cli::try_parse_from(["vuml", "mandelbrot", "--kernel", "m.spv"]).unwrap();
        match cli.command {
            Commands::Mandelbrot { width, height, output, .. } => {
                assert_eq!((width, height), (320, 240));
                assert_eq!(output, PathBuf::from("mandelbrot.ppm"));
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert!(Cli::try_parse_from(["vuml", "mandelbrot"]).is_err());
    }

    #[test]
    fn test_flags_override_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vuml.json");
        std::fs::write(&path, r#"{"log":{"level":"error"},"device":{"index":3}}"#).unwrap();
        let path_arg = path.to_string_lossy().into_owned();
        let cli = Cli::try_parse_from(["vuml", "--config", path_arg.as_str(), "--log-level", "info", "devices"]).unwrap();
        let config = load_config(&cli).unwrap();
        assert_eq!(config.log.level, LogLevel::Info);
        assert_eq!(config.device, DeviceSelection::Index(3));

        let cli = Cli::try_parse_from(["vuml", "--log-level", "loud", "devices"]).unwrap();
        assert!(load_config(&cli).is_err());
    }

    #[test]
    fn test_check_on_both_memory_layouts() {
        for mock in [MockDriver::discrete(), MockDriver::integrated()] {
            cmd_check(&device(&mock), 1000).unwrap();
            assert_eq!(mock.live_buffers(), 0);
        }
    }

    #[test]
    fn test_render_mandelbrot() {
        let mock = MockDriver::discrete();
        mock.register_kernel(MANDELBROT, |inv| {
            let params: MandelbrotParams = inv.push();
            assert_eq!(inv.spec_u32(0), Some(WORKGROUP));
            assert_eq!(inv.spec_u32(1), Some(WORKGROUP));
            let pixels: Vec<[f32; 4]> = (0..params.width * params.height)
                .map(|i| if i % params.width == 0 { [1.0, 1.0, 1.0, 1.0] } else { [0.0, 0.0, 0.0, 1.0] })
                .collect();
            inv.write(0, &pixels);
        });
        let pixels = render_mandelbrot(&device(&mock), MANDELBROT, 320, 240).unwrap();
        assert_eq!(pixels.len(), 320 * 240);
        assert_eq!(pixels[320], [1.0; 4]);
        assert_eq!(pixels[321], [0.0, 0.0, 0.0, 1.0]);
        assert_eq!(mock.dispatches()[0].grid, [10, 8, 1]);
        assert_eq!(
            mock.dispatches()[0].push_constants,
            bytemuck::bytes_of(&MandelbrotParams { width: 320, height: 240 }).to_vec()
        );
    }
}
