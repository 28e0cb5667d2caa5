//! Command-line front-end for reprogramming SPMP8000 devices in USB ISP mode.
//!
//! Every command can also run against a simulated device backed by a NAND image file, which is
//! handy for preparing or inspecting images without hardware.

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use log::info;

use std::fs::{self, File};
use std::path::PathBuf;
use std::time::Duration;

use spmp_isp::{
    device::{NandConfig, Session, SessionOptions, ROMBOOT_ADDR},
    error::ChannelError,
    format::{self, raw, DEFAULT_BOOTFILE_ID},
    nand::{Geometry, SimNand},
    sim::SimDevice,
    transport::{usb::UsbChannel, Channel, DekuContainerWrite},
    util::HexDump,
};

fn parse_hex(s: &str) -> Result<u32> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u32::from_str_radix(digits, 16).with_context(|| format!("invalid hex number {s:?}"))
}

#[derive(Args, Debug)]
struct DeviceOptions {
    /// Layout of a NAND to simulate instead of talking to USB, as BLOCKSxPAGESxBYTES
    #[clap(long)]
    sim_layout: Option<Geometry>,

    /// Path to the NAND image backing the simulated device
    #[clap(long, requires = "sim_layout")]
    sim_path: Option<PathBuf>,

    /// Write back the NAND image when done
    #[clap(long, requires = "sim_path")]
    sim_write: bool,
}

impl DeviceOptions {
    fn open(&self) -> Result<ChannelImpl> {
        let channel = if let Some(layout) = self.sim_layout {
            let mut nand = SimNand::new(layout);
            if let Some(path) = &self.sim_path {
                nand.load(&mut File::open(path)?)?;
            }

            ChannelImpl::Sim(SimDevice::with_nand(nand))
        } else {
            ChannelImpl::Usb(UsbChannel::open().context("could not open the SPMP8000 ISP device")?)
        };

        Ok(channel)
    }

    fn is_sim(&self) -> bool {
        self.sim_layout.is_some()
    }

    fn cleanup(&self, channel: ChannelImpl) -> Result<()> {
        if self.sim_write {
            if let Some(path) = &self.sim_path {
                if let ChannelImpl::Sim(device) = channel {
                    device.into_nand().save(&mut File::create(path)?)?;
                }
            }
        }

        Ok(())
    }
}

#[derive(Debug)]
enum ChannelImpl {
    Usb(UsbChannel),
    Sim(SimDevice),
}

impl Channel for ChannelImpl {
    fn send(&mut self, data: &[u8], timeout: Duration) -> Result<usize, ChannelError> {
        match self {
            Self::Usb(usb) => usb.send(data, timeout),
            Self::Sim(sim) => sim.send(data, timeout),
        }
    }

    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, ChannelError> {
        match self {
            Self::Usb(usb) => usb.receive(buf, timeout),
            Self::Sim(sim) => sim.receive(buf, timeout),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the device ID, the flash configuration and every bootfile found
    Info,

    /// Dump device memory to a file
    DumpRam {
        /// Start address, in hex
        #[clap(value_parser = parse_hex)]
        addr: u32,

        /// Number of bytes, in hex
        #[clap(value_parser = parse_hex)]
        len: u32,

        /// The file to write
        path: PathBuf,
    },

    /// Dump a byte range of the flash to a file
    DumpFlash {
        /// Start offset in the flash, in hex
        #[clap(value_parser = parse_hex)]
        addr: u32,

        /// Number of bytes, in hex
        #[clap(value_parser = parse_hex)]
        len: u32,

        /// The file to write
        path: PathBuf,
    },

    /// Dump the boot ROM to a file
    DumpRomboot {
        /// The file to write
        path: PathBuf,
    },

    /// Dump every bootfile to a BF<pat page>.bin file
    DumpBootfiles {
        /// Directory to put the files in
        #[clap(long, default_value = ".")]
        dir: PathBuf,
    },

    /// List the bootfiles found in the PAT search range
    ListBootfiles,

    /// Write a file to the flash, preserving the rest of every block it touches
    WriteFlash {
        /// Offset in the flash, in hex
        #[clap(value_parser = parse_hex)]
        addr: u32,

        /// The file to write
        path: PathBuf,
    },

    /// Write a file as a bootfile, together with the PAT page describing it
    WriteBootfile {
        /// Flash offset of the PAT page, in hex
        #[clap(value_parser = parse_hex)]
        pat_addr: u32,

        /// Flash offset of the bootfile data, in hex
        #[clap(value_parser = parse_hex)]
        data_addr: u32,

        /// The file to write
        path: PathBuf,

        /// Image id to put in the PAT page, in hex [default: 1984BABE]
        #[clap(long, value_parser = parse_hex)]
        id: Option<u32>,
    },
}

impl Command {
    fn execute<C: Channel>(self, session: &mut Session<C>) -> Result<()> {
        match self {
            Command::Info => {
                let id = session.read_device_id()?;
                println!("- ROMBOOT ID:\n{}", HexDump::new(0, &id));

                let config = session.get_flash_info()?;
                print_config(&config)?;

                if session.options().init_dram {
                    session.init_dram().context("can't init DRAM")?;
                    let config = session.get_flash_info()?;
                    println!("- DRAM inited\n");
                    print_config(&config)?;
                }

                list_bootfiles(session)?;
            }

            Command::DumpRam { addr, len, path } => {
                info!("Dumping RAM from {addr:08X}, length {len:08X} to {}", path.display());
                let mut buf = vec![0u8; len as usize];
                session.read_mem_chunked(addr, &mut buf)?;
                fs::write(&path, buf)?;
            }

            Command::DumpFlash { addr, len, path } => {
                info!("Dumping FLASH from {addr:08X}, length {len:08X} to {}", path.display());
                let data = raw::read_range(session, u64::from(addr), len as usize)?;
                fs::write(&path, data)?;
            }

            Command::DumpRomboot { path } => {
                info!("Dumping the romboot code ({ROMBOOT_ADDR:08X}) to {}", path.display());
                fs::write(&path, session.read_romboot()?)?;
            }

            Command::DumpBootfiles { dir } => {
                for bootfile in format::scan(session)? {
                    let (bootfile, mut image) = format::read_bootfile(session, bootfile.pat_page)?;
                    image.truncate(bootfile.size as usize);

                    let path = dir.join(format!("BF{:04X}.bin", bootfile.pat_page));
                    info!("Writing bootfile {:#010X} to {}", bootfile.id, path.display());
                    fs::write(&path, image)?;
                }
            }

            Command::ListBootfiles => list_bootfiles(session)?,

            Command::WriteFlash { addr, path } => {
                info!("Writing {} to flash addr {addr:08X}", path.display());
                let data = fs::read(&path)?;
                raw::write_random(session, u64::from(addr), &data)?;
            }

            Command::WriteBootfile {
                pat_addr,
                data_addr,
                path,
                id,
            } => {
                let page_size = session.geometry()?.page_size as u32;
                info!(
                    "Writing bootfile {} to {data_addr:08X} with PAT at {pat_addr:08X}",
                    path.display()
                );
                let data = fs::read(&path)?;
                format::build_and_write(
                    session,
                    id.unwrap_or(DEFAULT_BOOTFILE_ID),
                    pat_addr / page_size,
                    data_addr / page_size,
                    &data,
                )?;
            }
        };

        Ok(())
    }

    /// Does this command set up the session itself?
    fn is_info(&self) -> bool {
        matches!(self, Command::Info)
    }
}

fn print_config(config: &NandConfig) -> Result<()> {
    println!("- NAND Info:\n{config}");
    println!("Hexdump:\n{}\n", HexDump::new(0, &config.to_bytes()?));
    Ok(())
}

fn list_bootfiles<C: Channel>(session: &mut Session<C>) -> Result<()> {
    for bootfile in format::scan(session)? {
        println!("- Bootfile info:\n{bootfile}\n");
    }
    Ok(())
}

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    /// The device to talk to
    #[clap(flatten)]
    device: DeviceOptions,

    /// More output; may be repeated
    #[clap(short, long, action = ArgAction::Count)]
    debug: u8,

    /// Run the DRAM init code stored in flash first
    #[clap(short = 'D', long)]
    init_dram: bool,

    /// Don't send the built-in Micron 29F32G08 flash configuration
    #[clap(short = 'c', long)]
    no_flash_config: bool,

    /// Extra attempts for a block that fails verification
    #[clap(long, default_value_t = 0)]
    retries: usize,

    /// Timeout for each USB transfer, in milliseconds
    #[clap(long, default_value_t = 10_000)]
    timeout_ms: u64,

    /// The command to run
    #[clap(subcommand)]
    cmd: Command,
}

impl Cli {
    fn session_options(&self) -> SessionOptions {
        // The info command reports the device as found. A simulated device already reports its
        // own layout.
        let send_config = !self.cmd.is_info() && !self.no_flash_config && !self.device.is_sim();

        SessionOptions {
            init_dram: self.init_dram,
            flash_config: send_config.then_some(NandConfig::MICRON_29F32G08),
            write_retries: self.retries,
            timeout: Duration::from_millis(self.timeout_ms),
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Cli::parse();
    match args.debug {
        0 => {}
        1 => log::set_max_level(log::LevelFilter::Debug),
        _ => log::set_max_level(log::LevelFilter::Trace),
    }
    howudoin::init(howudoin::consumers::TermLine::default());

    let options = args.session_options();
    let channel = args.device.open()?;

    let mut session = if args.cmd.is_info() {
        // Info does its own setup, so it can show the state before and after DRAM init
        Session::new(channel, options)
    } else {
        Session::open(channel, options).context("can't read flash config")?
    };

    args.cmd.execute(&mut session)?;
    info!("Done");

    args.device.cleanup(session.into_channel())?;
    Ok(())
}
