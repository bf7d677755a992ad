#![no_std]
#![no_main]

use trine_user::{close, getargs, open, print, read, until_nul};

fn main() -> u8 {
    let mut args = [0u8; 129];
    if getargs(&mut args) < 0 {
        print(b"could not read arguments\n");
        return 2;
    }
    let name_len = until_nul(&args).len();
    if name_len == 0 {
        print(b"usage: cat <file>\n");
        return 2;
    }
    let fd = open(&args[..=name_len]);
    if fd < 0 {
        print(b"file open failed\n");
        return 2;
    }
    let mut buf = [0u8; 1024];
    let status = loop {
        let n = read(fd as i32, &mut buf);
        if n < 0 {
            print(b"file read failed\n");
            break 3;
        }
        if n == 0 {
            break 0;
        }
        print(&buf[..n as usize]);
    };
    close(fd as i32);
    status
}

trine_user::entry!(main);
