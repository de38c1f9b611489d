use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use nix::sys::termios::BaudRate;

use deltax::handshake::Coordinator;
use deltax::runner::{MacroRunner, RunState, RunnerEvent};
use deltax::serial::SerialChannel;
use deltax::status::{GrblDialect, StatusPoll, StatusReporter};

fn find_possible_tty_dev() -> Option<String> {
    for dir_entry in std::fs::read_dir("/dev/").ok()? {
        let dir_entry = dir_entry.ok()?;
        let os_file_name = dir_entry.file_name();
        let file_name = os_file_name.to_string_lossy();
        if file_name.starts_with("tty")
            && file_name.len() >= 6
            && (&file_name[3..6] == "USB" || &file_name[3..6] == "ACM")
        {
            return Some("/dev/".to_string() + &file_name);
        }
    }
    None
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let macro_path = args
        .next()
        .ok_or_else(|| anyhow!("usage: deltax <macro.gcode> [tty]"))?;
    let tty = match args.next() {
        Some(path) => path,
        None => find_possible_tty_dev().ok_or_else(|| anyhow!("found no terminal device"))?,
    };

    let channel = Arc::new(Mutex::new(SerialChannel::open(&tty, BaudRate::B115200)?));
    let coordinator = Coordinator::new(channel.clone());
    let reporter = Arc::new(StatusReporter::new(channel, GrblDialect));

    let (mut runner, events) = MacroRunner::new(coordinator);
    runner.load(&std::fs::read_to_string(&macro_path)?)?;
    let control = runner.control();

    let poller = reporter.clone();
    std::thread::spawn(move || loop {
        if let Ok(StatusPoll::Updated(snapshot)) = poller.poll() {
            let (x, y, z) = snapshot.position;
            println!("pos: X{x:.3} Y{y:.3} Z{z:.3}");
        }
        std::thread::sleep(Duration::from_millis(500));
    });

    std::thread::spawn(move || {
        for event in events {
            match event {
                RunnerEvent::Reached { index } => println!("> line {index}"),
                RunnerEvent::Step { index, outcome } => println!("  line {index}: {outcome:?}"),
                RunnerEvent::State(state) => println!("state: {state:?}"),
            }
        }
    });

    match runner.run() {
        RunState::Idle => Ok(()),
        state => Err(anyhow!(
            "macro ended in {state:?}: {:?}",
            control.last_fault()
        )),
    }
}
