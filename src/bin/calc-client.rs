use std::{
    io::{self, BufRead, Write},
    path::PathBuf,
    time::Duration,
};

use calc_rpc::{CalcError, FailoverClient, Operation, Response, endpoint};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(author, version)]
struct Cli {
    /// JSON endpoint table, defaults to the eight local servers.
    #[arg(short, long)]
    endpoints: Option<PathBuf>,
    /// Per-endpoint timeout in seconds.
    #[arg(short, long, default_value_t = 5)]
    timeout: u64,
}

const MENU: &str = "
===== RPC CALCULATOR CLIENT =====
1. Add
2. Subtract
3. Multiply
4. Divide
5. Exit";

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    let table = match &cli.endpoints {
        Some(path) => endpoint::load_table(path)?,
        None => endpoint::default_table(),
    };
    let mut client =
        FailoverClient::new(table)?.with_timeout(Duration::from_secs(cli.timeout.max(1)));

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        println!("{MENU}");
        let Some(line) = prompt(&mut lines, "Choose operation: ")? else {
            break;
        };
        let Ok(choice) = line.trim().parse::<usize>() else {
            println!("Invalid input. Please enter a number.");
            continue;
        };
        if choice == 5 {
            println!("Exiting client. Goodbye!");
            break;
        }
        let Some(&op) = choice
            .checked_sub(1)
            .and_then(|i| Operation::ARITHMETIC.get(i))
        else {
            println!("Invalid choice. Please try again.");
            continue;
        };

        let Some(line) = prompt(&mut lines, "Enter two numbers: ")? else {
            break;
        };
        let Some((lhs, rhs)) = parse_operands(&line) else {
            println!("Invalid input for numbers. Please enter two numbers.");
            continue;
        };

        match client.call(op, lhs, rhs) {
            Ok(outcome) => report(&outcome.response),
            Err(CalcError::AllEndpointsFailed(failures)) => {
                for failure in &failures {
                    println!(
                        "Failed to connect or get response from {}: {}",
                        failure.endpoint, failure.reason
                    );
                }
                println!(
                    "Operation failed. All known servers tried or none could complete the request."
                );
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Print `text` and read one line; `None` at end of input.
fn prompt(
    lines: &mut impl Iterator<Item = io::Result<String>>,
    text: &str,
) -> io::Result<Option<String>> {
    print!("{text}");
    io::stdout().flush()?;
    lines.next().transpose()
}

fn parse_operands(line: &str) -> Option<(f64, f64)> {
    let mut numbers = line.split_whitespace().map(str::parse::<f64>);
    match (numbers.next(), numbers.next(), numbers.next()) {
        (Some(Ok(lhs)), Some(Ok(rhs)), None) => Some((lhs, rhs)),
        _ => None,
    }
}

fn report(response: &Response) {
    match &response.error {
        None => println!(
            "SUCCESS! Result from {}: {:.2}",
            response.server_tag, response.result
        ),
        Some(error) => println!(
            "Server {} reported an error: {}",
            response.server_tag, error
        ),
    }
}
