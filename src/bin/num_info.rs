use std::env;
use std::error::Error;
use std::time::Duration;

use unitelway_proto::{connect, Config};

/// Usage: num_info <host> <port> [address]
fn main() -> Result<(), Box<dyn Error>> {
    let args: Vec<String> = env::args().skip(1).collect();
    let (host, port) = match args.as_slice() {
        [host, port, ..] => (host.as_str(), port.parse::<u16>()?),
        _ => return Err("usage: num_info <host> <port> [address]".into()),
    };
    let address: u8 = match args.get(2) {
        Some(address) => address.parse()?,
        None => 1,
    };

    let config = Config::new(address)?.with_timeout(Duration::from_secs(1));
    let num = connect(host, port, config)?;

    let identification = num.identification()?;
    println!(
        "{} type {:#04x}/{:#04x} version {:#04x}",
        identification.label.trim_end(),
        identification.product_type,
        identification.sub_type,
        identification.version
    );
    let status = num.status()?;
    println!(
        "state {:#04x} faults {:#04x} mode {:?}",
        status.state, status.faults, status.mode
    );
    println!("programme {}", num.programme_number()?);
    println!("{} bytes free", num.available_memory()?);
    num.close()?;
    Ok(())
}
