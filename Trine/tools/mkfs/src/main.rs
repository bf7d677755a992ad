// Builds a Trine filesystem image: a "." directory entry, the "rtc" device
// and one regular file per input path, named by its file name.
//
// usage: trine-mkfs <image> <file>...

use std::env;
use std::fs;
use std::path::Path;
use std::process;

use trine::fs::{ImageBuilder, BLOCK_SIZE, MAX_DENTRIES, NAME_LEN};

fn main() {
    let args: Vec<String> = env::args().skip(1).collect();
    let Some((out, inputs)) = args.split_first() else {
        eprintln!("usage: trine-mkfs <image> <file>...");
        process::exit(2);
    };
    match build(inputs) {
        Ok(image) => {
            if let Err(e) = fs::write(out, &image) {
                eprintln!("{}: {}", out, e);
                process::exit(1);
            }
            println!("{}: {} files, {} bytes", out, inputs.len(), image.len());
        }
        Err(msg) => {
            eprintln!("{}", msg);
            process::exit(1);
        }
    }
}

fn file_name(path: &str) -> Result<Vec<u8>, String> {
    let name = Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| format!("{}: no file name", path))?;
    if name.len() > NAME_LEN {
        return Err(format!("{}: name longer than {} bytes", name, NAME_LEN));
    }
    Ok(name.as_bytes().to_vec())
}

fn build(inputs: &[String]) -> Result<Vec<u8>, String> {
    if inputs.len() + 2 > MAX_DENTRIES {
        return Err(format!("at most {} files fit in the directory", MAX_DENTRIES - 2));
    }
    let mut files = Vec::new();
    for path in inputs {
        let contents = fs::read(path).map_err(|e| format!("{}: {}", path, e))?;
        files.push((file_name(path)?, contents));
    }

    let data_blocks: usize = files.iter().map(|(_, c)| c.len().div_ceil(BLOCK_SIZE)).sum();
    let mut image = vec![0u8; (1 + files.len() + data_blocks) * BLOCK_SIZE];
    let mut builder = ImageBuilder::new(&mut image, files.len() as u32).map_err(|e| e.to_string())?;
    builder.add_directory(b".").map_err(|e| e.to_string())?;
    builder.add_device(b"rtc").map_err(|e| e.to_string())?;
    for (name, contents) in &files {
        builder
            .add_file(name, contents)
            .map_err(|e| format!("{}: {}", String::from_utf8_lossy(name), e))?;
    }
    let len = builder.finish();
    image.truncate(len);
    Ok(image)
}
