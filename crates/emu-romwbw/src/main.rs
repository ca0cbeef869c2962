//! Headless terminal front end.
//!
//! Loads a firmware image (and optionally disks), then runs batches in a
//! simple foreground loop: stdin bytes feed the console queue, console
//! output goes to stdout.

use std::path::PathBuf;
use std::process;
use std::sync::mpsc;
use std::time::Duration;

use emu_romwbw::{BATCH_SIZE, HostIo, StdHostIo, System};
use simplelog::{ColorChoice, Config, LevelFilter, TermLogger, TerminalMode};

struct CliArgs {
    rom_path: Option<PathBuf>,
    romldr_path: Option<PathBuf>,
    disks: Vec<(usize, PathBuf)>,
    slices: Vec<(usize, u8)>,
    boot_string: Option<String>,
    debug: bool,
}

fn parse_args() -> CliArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut cli = CliArgs {
        rom_path: None,
        romldr_path: None,
        disks: Vec::new(),
        slices: Vec::new(),
        boot_string: None,
        debug: false,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--rom" => {
                i += 1;
                cli.rom_path = args.get(i).map(PathBuf::from);
            }
            "--romldr" => {
                i += 1;
                cli.romldr_path = args.get(i).map(PathBuf::from);
            }
            "--disk" => {
                // --disk N PATH
                let slot = args.get(i + 1).and_then(|s| s.parse().ok());
                let path = args.get(i + 2).map(PathBuf::from);
                if let (Some(slot), Some(path)) = (slot, path) {
                    cli.disks.push((slot, path));
                }
                i += 2;
            }
            "--slices" => {
                // --slices N COUNT
                let slot = args.get(i + 1).and_then(|s| s.parse().ok());
                let count = args.get(i + 2).and_then(|s| s.parse().ok());
                if let (Some(slot), Some(count)) = (slot, count) {
                    cli.slices.push((slot, count));
                }
                i += 2;
            }
            "--boot" => {
                i += 1;
                cli.boot_string = args.get(i).cloned();
            }
            "--debug" => {
                cli.debug = true;
            }
            "--help" | "-h" => {
                print_usage();
                process::exit(0);
            }
            other => {
                eprintln!("unknown argument: {other}");
                print_usage();
                process::exit(1);
            }
        }
        i += 1;
    }
    cli
}

fn print_usage() {
    eprintln!(
        "usage: emu-romwbw --rom FILE [--romldr FILE] [--disk N FILE]... \
         [--slices N COUNT]... [--boot STRING] [--debug]"
    );
}

fn main() {
    let cli = parse_args();

    let level = if cli.debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    };
    let _ = TermLogger::init(
        level,
        Config::default(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    );

    let Some(rom_path) = &cli.rom_path else {
        print_usage();
        process::exit(1);
    };

    let mut system = System::new(StdHostIo::new());
    if !system.load_rom(&rom_path.to_string_lossy()) {
        process::exit(1);
    }
    if let Some(romldr) = &cli.romldr_path
        && !system.load_romldr(&romldr.to_string_lossy())
    {
        process::exit(1);
    }
    for (slot, path) in &cli.disks {
        if !system.load_disk(*slot, &path.to_string_lossy()) {
            process::exit(1);
        }
    }
    for (slot, count) in &cli.slices {
        system.set_disk_slice_count(*slot, *count);
    }
    if let Some(boot) = &cli.boot_string {
        system.set_boot_string(boot);
    }

    // Stdin capture: a reader thread feeds the console queue so the batch
    // loop never blocks on the terminal.
    let (tx, rx) = mpsc::channel::<u8>();
    std::thread::spawn(move || {
        use std::io::Read;
        let stdin = std::io::stdin();
        for byte in stdin.lock().bytes() {
            match byte {
                Ok(b) => {
                    if tx.send(b).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    system.start();
    loop {
        while let Ok(ch) = rx.try_recv() {
            system.send_char(ch);
        }
        let executed = system.run_batch(BATCH_SIZE);
        system.flush_output();

        if system.is_halted() {
            eprintln!("\nCPU halted at PC={:#06X}", system.pc());
            break;
        }
        if !system.is_running() {
            break;
        }
        if system.is_waiting_for_input() {
            // Parked on a console read: wait for the next keystroke rather
            // than spinning.
            match rx.recv_timeout(Duration::from_millis(50)) {
                Ok(ch) => system.send_char(ch),
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        } else if executed == 0 {
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    if let Err(err) = system.host_mut().disk_flush_all() {
        eprintln!("disk flush failed: {err}");
    }
}
