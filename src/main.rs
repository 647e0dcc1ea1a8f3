// Copyright 2023 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

use std::{io::Write, fs::File, time::{Instant, Duration}};
use clap::{Command, Arg, ArgAction, ArgMatches, crate_description, crate_version, value_parser};
use clap_num::{maybe_hex, si_number};
use anyhow::bail;

use xmcdap::probe::{Probe, ProbeInfo};
use xmcdap::dap::DAP;
use xmcdap::swd::SWD;
use xmcdap::cortexm::CortexM;
use xmcdap::sim::SimTarget;
use xmcdap::{Target, WorkingArea, Flash, FlashController, UserLevel};

#[allow(clippy::cognitive_complexity)]
fn main() -> anyhow::Result<()> {
    let matches = Command::new("xmcdap")
        .version(crate_version!())
        .about(crate_description!())
        .subcommand_required(true)
        .arg_required_else_help(true)
        .propagate_version(true)
        .infer_subcommands(true)
        .arg(Arg::new("quiet")
             .help("Suppress informative output and raise log level to errors only")
             .long("quiet")
             .short('q')
             .action(ArgAction::SetTrue)
             .global(true))
        .arg(Arg::new("verbose")
             .help("Increase log level, specify once for info, twice for debug, three times for trace")
             .long("verbose")
             .short('v')
             .action(ArgAction::Count)
             .conflicts_with("quiet")
             .global(true))
        .arg(Arg::new("probe")
             .help("VID:PID[:SN] of CMSIS-DAP device to use")
             .long("probe")
             .short('p')
             .action(ArgAction::Set)
             .global(true))
        .arg(Arg::new("freq")
             .help("SWD clock frequency in Hz (k and M suffixes allowed)")
             .long("freq")
             .short('f')
             .action(ArgAction::Set)
             .default_value("1M")
             .value_parser(si_number::<u32>)
             .global(true))
        .arg(Arg::new("sim")
             .help("Use a simulated device with the given number of flash sectors instead of a probe")
             .long("sim")
             .action(ArgAction::Set)
             .value_parser(["8", "9", "12", "16"])
             .global(true))
        .arg(Arg::new("work-area")
             .help("Address of target RAM used by the flash writer (decimal, or hex with 0x prefix)")
             .long("work-area")
             .action(ArgAction::Set)
             .value_parser(maybe_hex::<u32>)
             .default_value("0x20000000")
             .global(true))
        .arg(Arg::new("work-area-size")
             .help("Size in bytes of target RAM used by the flash writer")
             .long("work-area-size")
             .action(ArgAction::Set)
             .value_parser(maybe_hex::<u32>)
             .default_value("0x4000")
             .global(true))
        .arg(Arg::new("passwords")
             .help("Flash protection passwords PW1,PW2 (decimal, or hex with 0x prefix)")
             .long("passwords")
             .action(ArgAction::Set)
             .value_delimiter(',')
             .num_args(2)
             .value_parser(maybe_hex::<u32>)
             .global(true))
        .subcommand(Command::new("probes")
            .about("List available CMSIS-DAP probes"))
        .subcommand(Command::new("reset")
            .about("Pulse the nRST line for 100ms"))
        .subcommand(Command::new("info")
            .about("Identify the device and report read and OTP protection"))
        .subcommand(Command::new("erase")
            .about("Erase flash sectors")
            .arg(Arg::new("first")
                 .help("First sector to erase, defaults to all sectors")
                 .value_parser(value_parser!(usize))
                 .requires("last"))
            .arg(Arg::new("last")
                 .help("Last sector to erase (inclusive)")
                 .value_parser(value_parser!(usize))))
        .subcommand(Command::new("write")
            .about("Write binary file to flash; sectors must already be erased")
            .arg(Arg::new("file")
                 .help("File to write to flash")
                 .required(true))
            .arg(Arg::new("offset")
                 .help("Page-aligned start offset (in bytes) to write to (decimal, or hex with 0x prefix)")
                 .long("offset")
                 .value_parser(maybe_hex::<u32>)
                 .default_value("0"))
            .arg(Arg::new("verify")
                 .help("Disable readback verification")
                 .short('n')
                 .long("no-verify")
                 .action(ArgAction::SetFalse)))
        .subcommand(Command::new("read")
            .about("Read flash contents to file")
            .arg(Arg::new("file")
                 .help("File to write flash contents to")
                 .required(true))
            .arg(Arg::new("offset")
                 .help("Start offset (in bytes) of read (decimal, or hex with 0x prefix)")
                 .long("offset")
                 .action(ArgAction::Set)
                 .value_parser(maybe_hex::<u32>)
                 .default_value("0"))
            .arg(Arg::new("length")
                 .help("Length (in bytes) of read, defaults to the rest of the bank \
                       (decimal, or hex with 0x prefix)")
                 .long("length")
                 .action(ArgAction::Set)
                 .value_parser(maybe_hex::<usize>)))
        .subcommand(Command::new("protect-check")
            .about("Read and print sector protection"))
        .subcommand(Command::new("protect")
            .about("Install write protection on a range of sectors, effective after reset")
            .arg(Arg::new("level")
                 .help("User level to install protection for (2 is permanent)")
                 .long("level")
                 .action(ArgAction::Set)
                 .value_parser(value_parser!(u32).range(0..=2))
                 .default_value("0"))
            .arg(Arg::new("read-protect")
                 .help("Also enable read protection (user level 0 only)")
                 .long("read-protect")
                 .action(ArgAction::SetTrue))
            .arg(Arg::new("first")
                 .help("First sector to protect")
                 .required(true)
                 .value_parser(value_parser!(usize)))
            .arg(Arg::new("last")
                 .help("Last sector to protect (inclusive)")
                 .required(true)
                 .value_parser(value_parser!(usize))))
        .subcommand(Command::new("unprotect")
            .about("Disable user level 0 write protection until the next reset"))
        .subcommand(Command::new("flash-unprotect")
            .about("Permanently remove protection by erasing a user configuration block")
            .arg(Arg::new("level")
                 .help("User level to remove protection for (0 or 1)")
                 .required(true)
                 .value_parser(value_parser!(u32))))
        .get_matches();

    let t0 = Instant::now();
    let quiet = matches.get_flag("quiet");
    let verbose = matches.get_count("verbose");
    let env = if quiet {
        env_logger::Env::default().default_filter_or("error")
    } else if verbose == 0 {
        env_logger::Env::default().default_filter_or("warn")
    } else if verbose == 1 {
        env_logger::Env::default().default_filter_or("info")
    } else if verbose == 2 {
        env_logger::Env::default().default_filter_or("debug")
    } else {
        env_logger::Env::default().default_filter_or("trace")
    };
    env_logger::Builder::from_env(env).format_timestamp(None).init();

    // Listing probes does not require first connecting to a probe,
    // so we just list them and quit early.
    if matches.subcommand_name() == Some("probes") {
        print_probe_list();
        return Ok(());
    }

    let work_area = *matches.get_one::<u32>("work-area").unwrap();
    let work_area_size = *matches.get_one::<u32>("work-area-size").unwrap();

    // A simulated device needs no probe at all.
    if let Some(sectors) = matches.get_one::<String>("sim") {
        let controller = match sectors.as_str() {
            "8" => FlashController::Sectors8,
            "9" => FlashController::Sectors9,
            "12" => FlashController::Sectors12,
            _ => FlashController::Sectors16,
        };
        if !quiet { println!("Using simulated {} device.", controller.devices()) };
        let mut sim = SimTarget::new(controller);
        sim.set_working_area(work_area_size);
        run(&mut sim, &matches, quiet)?;
    } else {
        let probe = if let Some(probe) = matches.get_one::<String>("probe") {
            ProbeInfo::from_specifier(probe)?.open()?
        } else {
            Probe::new()?
        };
        let dap = DAP::new(probe)?;

        // The reset command only needs the probe.
        if matches.subcommand_name() == Some("reset") {
            if !quiet { println!("Pulsing nRST line.") };
            return Ok(dap.pulse_nrst(Duration::from_millis(100))?);
        }

        if let Some(&freq) = matches.get_one::<u32>("freq") {
            dap.set_clock(freq)?;
        }
        let swd = SWD::new(dap)?;
        let mut core = CortexM::attach(swd, WorkingArea::new(work_area, work_area_size))?;
        let result = run(&mut core, &matches, quiet);
        core.detach()?;
        result?;
    }

    let t1 = t0.elapsed();
    if !quiet {
        println!("Finished in {}.{:02}s", t1.as_secs(), t1.subsec_millis()/10);
    }

    Ok(())
}

/// Handle the flash subcommands on a halted target.
fn run<T: Target>(target: &mut T, matches: &ArgMatches, quiet: bool) -> anyhow::Result<()> {
    let mut flash = Flash::new(target);
    if let Some(mut passwords) = matches.get_many::<u32>("passwords") {
        match (passwords.next(), passwords.next()) {
            (Some(&pw1), Some(&pw2)) => flash.set_passwords(pw1, pw2),
            _ => bail!("Specify both passwords as PW1,PW2."),
        }
    }
    flash.probe()?;

    match matches.subcommand() {
        Some(("reset", _)) => {
            if !quiet { println!("Nothing to reset on a simulated device.") };
        },
        Some(("info", _)) => {
            flash.protect_check()?;
            println!("{}", flash.get_info()?);
        },
        Some(("erase", matches)) => {
            let last_sector = flash.bank().sectors.len() - 1;
            let first = matches.get_one::<usize>("first").copied().unwrap_or(0);
            let last = matches.get_one::<usize>("last").copied().unwrap_or(last_sector);
            if quiet {
                flash.erase(first, last)?;
            } else {
                flash.erase_progress(first, last)?;
            }
        },
        Some(("write", matches)) => {
            let path = matches.get_one::<String>("file").unwrap();
            let offset = *matches.get_one::<u32>("offset").unwrap();
            let data = std::fs::read(path)?;
            if quiet {
                flash.write(offset, &data)?;
            } else {
                flash.write_progress(offset, &data)?;
            }
            if matches.get_flag("verify") {
                if !quiet { println!("Verifying...") };
                flash.verify(offset, &data)?;
            }
        },
        Some(("read", matches)) => {
            let path = matches.get_one::<String>("file").unwrap();
            let offset = *matches.get_one::<u32>("offset").unwrap();
            let length = if let Some(&length) = matches.get_one::<usize>("length") {
                length
            } else {
                log::info!("No length specified, reading to the end of flash");
                flash.bank().size.saturating_sub(offset) as usize
            };
            let data = if quiet {
                flash.read(offset, length)?
            } else {
                flash.read_progress(offset, length)?
            };
            let mut file = File::create(path)?;
            file.write_all(&data)?;
        },
        Some(("protect-check", _)) => {
            flash.protect_check()?;
            let bank = flash.bank();
            for (i, sector) in bank.sectors.iter().enumerate() {
                let protected = match sector.is_protected {
                    Some(true) => "protected",
                    Some(false) => "not protected",
                    None => "unknown",
                };
                let otp = if bank.protection.otp.get(i) == Some(&true) { " (OTP)" } else { "" };
                println!("Sector {:2}: 0x{:08X} {:4}k {}{}",
                         i, bank.base + sector.offset, sector.size / 1024, protected, otp);
            }
            if bank.protection.read_protected {
                println!("Flash is read protected");
            }
        },
        Some(("protect", matches)) => {
            let level = UserLevel::from_index(*matches.get_one::<u32>("level").unwrap())?;
            let read_protect = matches.get_flag("read-protect");
            let first = *matches.get_one::<usize>("first").unwrap();
            let last = *matches.get_one::<usize>("last").unwrap();
            if !quiet { println!("Installing user level {} protection...", level.index()) };
            flash.protect_level(level, read_protect, first, last)?;
            if !quiet { println!("Protection installed; reset the device for it to take effect.") };
        },
        Some(("unprotect", _)) => {
            if !quiet { println!("Disabling flash write protection...") };
            flash.protect(false, 0, 0)?;
        },
        Some(("flash-unprotect", matches)) => {
            let level = *matches.get_one::<u32>("level").unwrap();
            flash.flash_unprotect(level)?;
            if !quiet { println!("Protection removed; reset the device for it to take effect.") };
        },
        _ => panic!("Unhandled command."),
    }

    Ok(())
}

fn print_probe_list() {
    let probes = ProbeInfo::list();
    if probes.is_empty() {
        println!("No CMSIS-DAP probes found.");
    } else {
        println!("Found {} CMSIS-DAP probe{}:", probes.len(),
                 if probes.len() == 1 { "" } else { "s" });
        for probe in probes {
            println!("  {}", probe);
        }
    }
}
