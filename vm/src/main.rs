use clap::{Parser, Subcommand};
use log::{LevelFilter, info};
use std::process;
use std::time::Duration;

use bytecode::printer::{Indices, listing};
use bytecode::{BytecodeBuilder, Constant};
use object::{InstanceFormat, MethodHeader, Oop, Value};
use vm::special::{install, method_context, new_semaphore, spawn};
use vm::{RuntimeError, VM, VmConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log filter; falls back to RUST_LOG when absent
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<LevelFilter>,

    /// Interrupt check period in milliseconds
    #[arg(long, default_value_t = 3)]
    interval_ms: u64,

    /// Native activations allowed before a stack overflow
    #[arg(long, default_value_t = 4096)]
    max_frames: usize,

    /// Do not start the interrupt ticker thread
    #[arg(long)]
    no_ticker: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the decoded listing of hex-encoded bytecodes
    Disasm {
        /// Bytecodes, e.g. "76 88 73 c6"
        hex: Vec<String>,
    },
    /// Run a small in-memory image and print its result
    Demo,
}

impl Cli {
    fn config(&self) -> VmConfig {
        VmConfig {
            interrupt_interval: Duration::from_millis(self.interval_ms),
            ticker: !self.no_ticker,
            max_frames: self.max_frames,
            ..VmConfig::default()
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let mut logger = env_logger::Builder::from_default_env();
    if let Some(level) = cli.log_level {
        logger.filter_level(level);
    }
    logger.init();

    match &cli.command {
        Command::Disasm { hex } => match parse_hex(&hex.concat()) {
            Ok(bytes) => print!("{}", listing(&bytes, &Indices)),
            Err(err) => {
                eprintln!("Error: {err}");
                process::exit(2);
            }
        },
        Command::Demo => match run_demo(cli.config()) {
            Ok(result) => println!("{result}"),
            Err(err) => {
                eprintln!("Error running demo: {err}");
                process::exit(1);
            }
        },
    }
}

fn parse_hex(text: &str) -> Result<Vec<u8>, String> {
    let digits: String = text.chars().filter(|c| !c.is_whitespace() && *c != ',').collect();
    let digits = digits.strip_prefix("0x").unwrap_or(&digits);
    if digits.len() % 2 != 0 {
        return Err(format!("odd number of hex digits in '{text}'"));
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&digits[i..i + 2], 16).map_err(|err| format!("'{}': {err}", &digits[i..i + 2])))
        .collect()
}

fn header(num_args: u8, num_temps: u8) -> MethodHeader {
    MethodHeader {
        num_args,
        num_temps,
        ..MethodHeader::default()
    }
}

/// Two processes hand control back and forth through a pair of semaphores,
/// then the main process adds the result of a non-local return.
fn run_demo(config: VmConfig) -> Result<String, RuntimeError> {
    let mut vm = VM::new(config)?;
    let object = vm.memory.special.object;
    let demo = vm.memory.new_class("Demo", Some(object), InstanceFormat::Fixed, 0)?;

    // Demo>>escape  [:x | ^x + 1] value: 41. ^0
    let mut b = BytecodeBuilder::new();
    let block = b.push_closure(0, 1);
    b.push_temporary(0);
    b.push_constant(Constant::Int(1));
    b.special_send(0);
    b.return_top();
    b.end_closure(block);
    b.push_constant(Constant::Int(41));
    b.special_send(26); // value:
    b.pop();
    b.return_constant(Constant::Int(0));
    install(&mut vm.memory, demo, "escape", header(0, 0), Vec::new(), b.into_bytes())?;

    let ping = new_semaphore(&mut vm.memory)?;
    let pong = new_semaphore(&mut vm.memory)?;
    let log = vm.memory.new_array(vec![Value::Int(0)]);
    let signal = sym(&mut vm, "signal");
    let wait = sym(&mut vm, "wait");
    let at_put = sym(&mut vm, "at:put:");
    let escape = sym(&mut vm, "escape");

    // Worker: ping wait. log at: 1 put: 1000. pong signal. ping wait
    let mut b = BytecodeBuilder::new();
    b.push_literal_constant(0);
    b.send(3, 0);
    b.pop();
    b.push_literal_constant(2);
    b.push_constant(Constant::Int(1));
    b.push_literal_constant(5);
    b.send(4, 2);
    b.pop();
    b.push_literal_constant(1);
    b.send(6, 0);
    b.pop();
    b.push_literal_constant(0);
    b.send(3, 0);
    b.return_top();
    let worker = vm.memory.new_method(
        header(0, 0),
        vec![
            Value::Ref(ping),
            Value::Ref(pong),
            Value::Ref(log),
            wait,
            at_put,
            Value::Int(1000),
            signal,
        ],
        b.into_bytes(),
    );
    let nil = vm.memory.nil();
    spawn(&mut vm, worker, nil, config.bootstrap_priority)?;

    // Main: ping signal. pong wait. ^(log at: 1) + self escape
    let mut b = BytecodeBuilder::new();
    b.push_literal_constant(0);
    b.send(3, 0);
    b.pop();
    b.push_literal_constant(1);
    b.send(4, 0);
    b.pop();
    b.push_literal_constant(2);
    b.push_constant(Constant::Int(1));
    b.special_send(16); // at:
    b.push_receiver();
    b.send(5, 0);
    b.special_send(0);
    b.return_top();
    let main = vm.memory.new_method(
        header(0, 0),
        vec![Value::Ref(ping), Value::Ref(pong), Value::Ref(log), signal, wait, escape],
        b.into_bytes(),
    );
    let receiver = Value::Ref(vm.memory.instantiate(demo, 0)?);
    let ctx = method_context(&mut vm.memory, main, receiver, &[])?;
    let result = vm.run(ctx)?;
    info!("demo finished, cache stats: {:?}", vm.caches.stats());
    Ok(vm.memory.describe(result))
}

fn sym(vm: &mut VM, name: &str) -> Value {
    let oop: Oop = vm.memory.intern(name);
    Value::Ref(oop)
}
