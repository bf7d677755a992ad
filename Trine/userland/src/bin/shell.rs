#![no_std]
#![no_main]

use trine_user::{execute, print, read, ABNORMAL_EXIT, STDIN};

const PROMPT: &[u8] = b"391OS> ";
const LINE_MAX: usize = 128;

fn main() -> u8 {
    let mut line = [0u8; LINE_MAX + 1];
    loop {
        print(PROMPT);
        let n = read(STDIN, &mut line[..LINE_MAX]);
        if n < 0 {
            print(b"read from keyboard failed\n");
            return 3;
        }
        let mut len = n as usize;
        // drop the newline and any trailing carriage return
        while len > 0 && (line[len - 1] == b'\n' || line[len - 1] == b'\r') {
            len -= 1;
        }
        if len == 0 {
            continue;
        }
        if &line[..len] == b"exit" {
            return 0;
        }
        line[len] = 0;
        match execute(&line[..=len]) {
            -1 => print(b"no such command\n"),
            ABNORMAL_EXIT => print(b"program terminated abnormally\n"),
            _ => {}
        }
    }
}

trine_user::entry!(main);
