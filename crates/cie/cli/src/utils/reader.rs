use cie_apdu_transport_pcsc::PcscDeviceManager;
use cie_sdk::classify;

/// List all available readers
pub(crate) fn list_readers(manager: &PcscDeviceManager) -> eyre::Result<()> {
    let readers = manager.list_readers()?;

    if readers.is_empty() {
        println!("No readers found!");
        return Ok(());
    }

    println!("Available readers:");
    for (i, reader) in readers.iter().enumerate() {
        match reader.atr() {
            Some(atr) => println!(
                "{}. {} (card present, ATR {}, profile {})",
                i + 1,
                reader.name(),
                hex::encode_upper(atr),
                classify(atr)
            ),
            None => println!("{}. {} (no card)", i + 1, reader.name()),
        }
    }

    Ok(())
}
