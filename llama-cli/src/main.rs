use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use llama_inference::{quantize_model, Ftype, Session, SessionParams, TOKEN_EOS};
use log::{error, info};

/// Define the generate subcommand.
fn generate_subcommand() -> Command {
    Command::new("generate")
        .about("Run text generation with a LLaMA-family model")
        .arg(
            Arg::new("model")
                .help("Path to the model file (ggml/ggmf/ggjt format)")
                .required(true)
                .index(1),
        )
        .arg(
            Arg::new("prompt")
                .short('p')
                .long("prompt")
                .value_name("STRING")
                .help("Prompt to start generation with")
                .required(true),
        )
        .arg(
            Arg::new("n-predict")
                .short('n')
                .long("n-predict")
                .value_name("INT")
                .help("Number of tokens to predict")
                .default_value("128")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("ctx-size")
                .short('c')
                .long("ctx-size")
                .value_name("INT")
                .help("Context window size")
                .default_value("512")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new("threads")
                .short('t')
                .long("threads")
                .value_name("INT")
                .help("Number of threads to use during computation (0 = rayon default)")
                .default_value("0")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("batch-size")
                .short('b')
                .long("batch-size")
                .value_name("INT")
                .help("Batch size for prompt processing")
                .default_value("8")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("seed")
                .short('s')
                .long("seed")
                .value_name("INT")
                .help("Random seed (0 = time-based)")
                .default_value("0")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("temp")
                .long("temp")
                .value_name("FLOAT")
                .help("Sampling temperature (<= 0 selects greedy argmax)")
                .default_value("0.8")
                .value_parser(clap::value_parser!(f32)),
        )
        .arg(
            Arg::new("top-k")
                .long("top-k")
                .value_name("INT")
                .help("Top-k sampling cutoff (<= 0 disables)")
                .default_value("40")
                .value_parser(clap::value_parser!(i32)),
        )
        .arg(
            Arg::new("top-p")
                .long("top-p")
                .value_name("FLOAT")
                .help("Top-p (nucleus) sampling cutoff")
                .default_value("0.95")
                .value_parser(clap::value_parser!(f32)),
        )
        .arg(
            Arg::new("repeat-penalty")
                .long("repeat-penalty")
                .value_name("FLOAT")
                .help("Penalty applied to recently emitted tokens")
                .default_value("1.10")
                .value_parser(clap::value_parser!(f32)),
        )
        .arg(
            Arg::new("repeat-last-n")
                .long("repeat-last-n")
                .value_name("INT")
                .help("Window of recent tokens the penalty considers")
                .default_value("64")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("memory-f16")
                .long("memory-f16")
                .help("Keep the KV-cache in f16 to halve its footprint")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("no-mmap")
                .long("no-mmap")
                .help("Load tensors with buffered reads instead of mmap")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("mlock")
                .long("mlock")
                .help("Ask the OS to keep the model resident in memory")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("ignore-eos")
                .long("ignore-eos")
                .help("Keep generating past the end-of-sequence token")
                .action(ArgAction::SetTrue),
        )
}

/// Define the quantize subcommand.
fn quantize_subcommand() -> Command {
    Command::new("quantize")
        .about("Requantize a model file to a 4-bit dtype")
        .arg(
            Arg::new("input")
                .help("Input model file")
                .required(true)
                .index(1),
        )
        .arg(
            Arg::new("output")
                .help("Output model file (written in ggjt format)")
                .required(true)
                .index(2),
        )
        .arg(
            Arg::new("type")
                .help("Target type: q4_0 or q4_1")
                .default_value("q4_0")
                .index(3),
        )
}

fn run_generate_command(matches: &ArgMatches) -> Result<()> {
    let model_path = matches.get_one::<String>("model").unwrap();
    let prompt = matches.get_one::<String>("prompt").unwrap();
    let n_predict = *matches.get_one::<usize>("n-predict").unwrap();
    let n_threads = *matches.get_one::<usize>("threads").unwrap();
    let batch_size = (*matches.get_one::<usize>("batch-size").unwrap()).max(1);
    let temp = *matches.get_one::<f32>("temp").unwrap();
    let top_k = *matches.get_one::<i32>("top-k").unwrap();
    let top_p = *matches.get_one::<f32>("top-p").unwrap();
    let repeat_penalty = *matches.get_one::<f32>("repeat-penalty").unwrap();
    let repeat_last_n = *matches.get_one::<usize>("repeat-last-n").unwrap();
    let ignore_eos = matches.get_flag("ignore-eos");

    let params = SessionParams {
        n_ctx: *matches.get_one::<u32>("ctx-size").unwrap(),
        seed: *matches.get_one::<u64>("seed").unwrap(),
        f16_kv: matches.get_flag("memory-f16"),
        use_mmap: !matches.get_flag("no-mmap"),
        use_mlock: matches.get_flag("mlock"),
        ..Default::default()
    };

    let mut session = Session::new(Path::new(model_path), params)
        .with_context(|| format!("failed to load model from {model_path}"))?;

    let tokens = session.tokenize(prompt, true);
    anyhow::ensure!(
        tokens.len() < session.n_ctx(),
        "prompt is {} tokens, which does not fit the context of {}",
        tokens.len(),
        session.n_ctx()
    );

    let mut stdout = std::io::stdout().lock();
    let mut last_n_tokens: Vec<u32> = Vec::new();
    let mut n_past = 0usize;

    for chunk in tokens.chunks(batch_size) {
        session.eval(chunk, n_past, n_threads)?;
        n_past += chunk.len();
        last_n_tokens.extend_from_slice(chunk);
    }
    for &token in &tokens {
        if let Some(bytes) = session.token_bytes(token) {
            stdout.write_all(bytes)?;
        }
    }
    stdout.flush()?;

    for _ in 0..n_predict {
        if n_past >= session.n_ctx() {
            break;
        }

        if last_n_tokens.len() > repeat_last_n {
            let drop = last_n_tokens.len() - repeat_last_n;
            last_n_tokens.drain(..drop);
        }
        let token = session.sample(&last_n_tokens, top_k, top_p, temp, repeat_penalty);
        if token == TOKEN_EOS && !ignore_eos {
            break;
        }

        if let Some(bytes) = session.token_bytes(token) {
            stdout.write_all(bytes)?;
            stdout.flush()?;
        }
        last_n_tokens.push(token);

        session.eval(&[token], n_past, n_threads)?;
        n_past += 1;
    }
    stdout.write_all(b"\n")?;
    stdout.flush()?;

    info!("\n{}", session.timings());
    Ok(())
}

fn run_quantize_command(matches: &ArgMatches) -> Result<()> {
    let input = matches.get_one::<String>("input").unwrap();
    let output = matches.get_one::<String>("output").unwrap();
    let ftype = match matches.get_one::<String>("type").unwrap().as_str() {
        "q4_0" => Ftype::MostlyQ4_0,
        "q4_1" => Ftype::MostlyQ4_1,
        other => anyhow::bail!("unknown quantization type: {other}"),
    };

    quantize_model(Path::new(input), Path::new(output), ftype)
        .with_context(|| format!("failed to quantize {input} into {output}"))?;
    Ok(())
}

fn execute_commands() -> Result<()> {
    // Plain log lines without timestamp or module prefix.
    env_logger::Builder::from_default_env()
        .format(|buf, record| {
            use std::io::Write;
            writeln!(buf, "{}", record.args())
        })
        .init();

    let matches = Command::new("llama")
        .about("LLaMA CLI: run and requantize LLaMA-family models")
        .subcommand(generate_subcommand())
        .subcommand(quantize_subcommand())
        .get_matches();

    match matches.subcommand() {
        Some(("generate", matches)) => run_generate_command(matches),
        Some(("quantize", matches)) => run_quantize_command(matches),
        _ => anyhow::bail!("No subcommand specified. Use -h to print help information."),
    }
}

fn main() {
    if let Err(e) = execute_commands() {
        error!("Error: {e:#}");
        std::process::exit(1);
    }
}
