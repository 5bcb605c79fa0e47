//! Command-line argument parsing for the playout tool

/// Parse command line arguments
#[derive(Debug, Default)]
pub struct Args {
    /// Run as a synthetic-frame sender instead of a receiver
    pub send: bool,
    pub validate: bool,
    pub help: bool,
    /// Stop after this many seconds instead of waiting for Ctrl+C
    pub duration_secs: Option<u64>,
}

pub fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    parse_args_from(&args)
}

pub fn parse_args_from(args: &[String]) -> Args {
    let mut result = Args::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--send" => result.send = true,
            "--validate" => result.validate = true,
            "--help" | "-h" => result.help = true,
            "--duration" => {
                if i + 1 < args.len() {
                    i += 1;
                    result.duration_secs = args[i].parse().ok();
                }
            }
            _ => {}
        }
        i += 1;
    }

    result
}

pub fn print_help() {
    println!("playout - RTP playout buffer and test sender\n");
    println!("USAGE:");
    println!("    playout [OPTIONS]\n");
    println!("OPTIONS:");
    println!("    --send                  Send synthetic video frames to REMOTE_ADDR");
    println!("    --duration SECS         Stop after SECS seconds (default: run until Ctrl+C)");
    println!("    --validate              Validate configuration and exit");
    println!("    --help, -h              Show this help message\n");
    println!("ENVIRONMENT:");
    println!("    RTP_PORT, PLAYOUT_DELAY_MS, PLAYOUT_OFFSET_MS, MEDIA_CLOCK_RATE,");
    println!("    STATS_REPORT_SECS, DECODE_TICK_MS, METRICS_PORT      (receive)");
    println!("    REMOTE_ADDR, MTU, SEND_RATE_BPS, FRAME_WIDTH,");
    println!("    FRAME_HEIGHT, FRAME_FPS                              (send)");
}
