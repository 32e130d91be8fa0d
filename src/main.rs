use anyhow::Result;
use clap::Parser;
use log::info;
use t3unlock::device_ids;
use t3unlock::protocol::run_unlock;
use t3unlock::usb::UsbTransport;

/// Send the vendor unlock handshake to a password-locked Samsung portable SSD
/// (USB ID 04e8:61f4) so it re-enumerates as a normal drive.
#[derive(Parser, Debug)]
#[command(name = "t3unlock", version)]
struct Opt {
    /// Password set on the device
    password: String,

    /// Skip the USB port reset normally issued before the handshake
    #[arg(long)]
    no_reset: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(
        env_logger::Env::new()
            .filter_or("T3UNLOCK_LOG", "info")
            .write_style("T3UNLOCK_LOG_STYLE"),
    )
    .init();

    let opt = Opt::parse();

    let mut transport = UsbTransport::new(
        device_ids::T3_LOCKED,
        device_ids::UNLOCK_INTERFACE,
        !opt.no_reset,
    );

    run_unlock(&opt.password, &mut transport)?;

    info!("unlock handshake complete; the device should re-enumerate unlocked");
    Ok(())
}
