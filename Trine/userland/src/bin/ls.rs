#![no_std]
#![no_main]

use trine_user::{open, print, read};

fn main() -> u8 {
    let fd = open(b".\0");
    if fd < 0 {
        print(b"directory open failed\n");
        return 2;
    }
    let mut name = [0u8; 33];
    loop {
        let n = read(fd as i32, &mut name[..32]);
        if n < 0 {
            print(b"directory entry read failed\n");
            return 3;
        }
        if n == 0 {
            return 0;
        }
        print(&name[..n as usize]);
        print(b"\n");
    }
}

trine_user::entry!(main);
