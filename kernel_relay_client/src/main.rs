use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use kernel_relay::ImageRequest;
use kernel_relay::core_modules::kernel::{self, CATALOG};
use kernel_relay_server::protocol::{
    DEFAULT_MAX_PAYLOAD, read_image_response, read_status_line, send_image_request, send_line_request,
};
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tracing::debug;

const USAGE: &str = "Usage:
  kernel_relay_client binary <addr> <image_path> <filter_id> [out_dir]
  kernel_relay_client line   <addr> <filter_id> <input_path> <output_path>";

#[tokio::main]
async fn main() -> Result<()> {
    kernel_relay_server::telemetry::init();

    // --- 1. Argument Parsing ---
    let args: Vec<String> = env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("binary") if args.len() >= 5 => {
            let out_dir = args.get(5).map_or_else(|| PathBuf::from("."), PathBuf::from);
            run_binary(&args[2], Path::new(&args[3]), &args[4], &out_dir).await
        }
        Some("line") if args.len() >= 6 => run_line(&args[2], &args[3], Path::new(&args[4]), Path::new(&args[5])).await,
        _ => {
            println!("{USAGE}\n\nFilters:\n{}", catalog_listing());
            Ok(())
        }
    }
}

/// Uploads one image and saves the filtered result as `filtered_<name>`.
async fn run_binary(addr: &str, image_path: &Path, filter: &str, out_dir: &Path) -> Result<()> {
    let filter_id = parse_filter(filter)?;
    let data = tokio::fs::read(image_path)
        .await
        .with_context(|| format!("failed to read {}", image_path.display()))?;
    let name = image_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| anyhow!("{} has no file name", image_path.display()))?;

    // --- 2. Exchange ---
    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("failed to connect to {addr}"))?;
    let (reader, mut writer) = stream.into_split();
    debug!(%addr, %name, filter_id, bytes = data.len(), "sending image");
    send_image_request(&mut writer, &ImageRequest { name, data, filter_id }).await?;
    let response = read_image_response(&mut BufReader::new(reader), DEFAULT_MAX_PAYLOAD).await?;

    // --- 3. Save ---
    // Only the final component of the echoed name is trusted.
    let file_name = Path::new(&response.name)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    tokio::fs::create_dir_all(out_dir)
        .await
        .with_context(|| format!("failed to create {}", out_dir.display()))?;
    let output = out_dir.join(format!("filtered_{file_name}"));
    tokio::fs::write(&output, &response.data)
        .await
        .with_context(|| format!("failed to write {}", output.display()))?;

    println!("Filtered image saved to {}", output.display());
    Ok(())
}

/// Asks the server to filter a file on its own filesystem.
async fn run_line(addr: &str, filter: &str, input: &Path, output: &Path) -> Result<()> {
    let filter_id = parse_filter(filter)?;
    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("failed to connect to {addr}"))?;
    let (reader, mut writer) = stream.into_split();
    send_line_request(&mut writer, filter_id, input, output).await?;
    let status = read_status_line(&mut BufReader::new(reader)).await?;
    println!("{status}");
    Ok(())
}

fn parse_filter(raw: &str) -> Result<i64> {
    let id: i64 = raw
        .trim()
        .parse()
        .with_context(|| format!("filter id must be a number, got {raw:?}"))?;
    kernel::resolve(id).map_err(|_| anyhow!("unknown filter {id}; available filters:\n{}", catalog_listing()))?;
    Ok(id)
}

fn catalog_listing() -> String {
    CATALOG
        .iter()
        .map(|(id, name)| format!("  {id}: {name}"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_ids_are_accepted() {
        for (id, _) in CATALOG {
            assert_eq!(parse_filter(&id.to_string()).unwrap(), id);
        }
        assert_eq!(parse_filter(" 3 ").unwrap(), 3);
    }

    #[test]
    fn unknown_filter_lists_the_catalog() {
        let err = parse_filter("99").unwrap_err().to_string();
        assert!(err.contains("unknown filter 99"));
        assert!(err.contains("gaussian-blur"));
        assert!(parse_filter("blur").is_err());
    }
}
