use std::env;
use std::process::ExitCode;

use coldbrew_engine::class::ClassBuilder;
use coldbrew_engine::program::{AccessFlags, MethodBuilder};
use coldbrew_engine::{Config, Jvm, RuntimeError, Thread, Value};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// `static int factorial(int n)` as emitted by javac:
/// `int x = 1; for (int i = 2; i <= n; i++) x *= i; return x;`
const FACTORIAL: [u8; 21] = [
    4, 60, 5, 61, 28, 26, 163, 0, 13, 27, 28, 104, 60, 132, 2, 1, 167, 255, 244, 27, 172,
];

fn run(n: i32, trace_opcodes: bool) -> Result<Value, RuntimeError> {
    let jvm = Jvm::new(Config::default().with_trace_opcodes(trace_opcodes))?;
    let class = jvm.define_class(
        ClassBuilder::new("demo/Factorial").method(
            MethodBuilder::new("factorial", "(I)I")
                .access(AccessFlags::PUBLIC | AccessFlags::STATIC)
                .code(2, 3, FACTORIAL.to_vec()),
        ),
    )?;
    let method = class
        .declared_method("factorial", "(I)I")
        .ok_or_else(|| RuntimeError::Internal("factorial was not defined".into()))?;
    let mut thread = Thread::new(jvm);
    thread.invoke(&method, &[Value::Int(n)])
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    let trace_opcodes = args.iter().any(|a| a == "--trace");
    let n = match args.iter().find(|a| !a.starts_with("--")).map(|a| a.parse::<i32>()) {
        None => 10,
        Some(Ok(n)) => n,
        Some(Err(err)) => {
            error!(%err, "expected an integer argument");
            return ExitCode::FAILURE;
        }
    };

    match run(n, trace_opcodes) {
        Ok(value) => {
            info!(n, %value, "factorial");
            println!("{}", value);
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(%err, "execution failed");
            ExitCode::FAILURE
        }
    }
}
