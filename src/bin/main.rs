use anyhow::Context;
use candle_core::{DType, Device};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use clap::{Parser, Subcommand};
use pairtune::data::{
    download_and_load_file, partition_data, AlpacaPromptFormatter, PairwiseDataCollator,
    PreferenceDataLoader, PreferenceDataset, PREFERENCE_DATA_URL,
};
use pairtune::generate::{generate_text, GenerationConfig, TextStreamer, EOS_TOKEN_ID};
use pairtune::loss::PairwiseLogisticLoss;
use pairtune::model::{modify_out_head_for_reward, Config, GPTModel};
use pairtune::server::{build_chat_prompt, serve, ChatState, ChatTurn};
use pairtune::train::{
    calc_reward_accuracy_loader, plot_losses, reward_accuracy_table, train_reward_model,
};
use rand::{rngs::StdRng, SeedableRng};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::{mpsc::sync_channel, Arc};
use tiktoken_rs::get_bpe_from_model;
use tracing_subscriber::EnvFilter;

/// CLI
#[derive(Debug, Parser)]
#[command(name = "pairtune")]
#[command(
    about = "Pairwise preference (reward model) fine-tuning, plus a browser chat demo.",
    long_about = None
)]
struct Cli {
    /// Run on the first cuda device (requires the `cuda` feature)
    #[arg(long, global = true)]
    cuda: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Train a reward model on a pairwise preference dataset
    Train {
        /// Preference dataset json; downloaded if missing
        #[arg(long, default_value = "data/instruction-data-with-preference.json")]
        data: PathBuf,
        /// Where to save the trained weights
        #[arg(long, default_value = "reward-model.safetensors")]
        output: PathBuf,
        #[arg(long, default_value_t = 3)]
        epochs: usize,
        #[arg(long, default_value_t = 4)]
        batch_size: usize,
        #[arg(long, default_value_t = 5e-5)]
        lr: f64,
        /// Sequences longer than this are truncated from the front
        #[arg(long, default_value_t = 1_024)]
        max_length: usize,
        /// Evaluate every this many optimizer steps
        #[arg(long, default_value_t = 5)]
        eval_freq: usize,
        /// Number of batches per evaluation
        #[arg(long, default_value_t = 5)]
        eval_iter: usize,
        /// Write an html loss-curve plot here
        #[arg(long)]
        plot: Option<PathBuf>,
    },
    /// Report ranking accuracy of a trained reward model on all splits
    Eval {
        #[arg(long, default_value = "data/instruction-data-with-preference.json")]
        data: PathBuf,
        #[arg(long, default_value = "reward-model.safetensors")]
        checkpoint: PathBuf,
        #[arg(long, default_value_t = 4)]
        batch_size: usize,
        #[arg(long, default_value_t = 1_024)]
        max_length: usize,
    },
    /// Serve the browser chat demo
    Serve {
        #[arg(long, default_value = "127.0.0.1:3000")]
        addr: String,
        /// Model weights to load; random weights when omitted
        #[arg(long)]
        checkpoint: Option<PathBuf>,
    },
    /// Chat with a model in the terminal
    Chat {
        /// Model weights to load; random weights when omitted
        #[arg(long)]
        checkpoint: Option<PathBuf>,
        #[arg(long, default_value_t = 1_024)]
        max_length: usize,
        #[arg(long, default_value_t = 0.7)]
        top_p: f32,
        #[arg(long, default_value_t = 0.95)]
        temperature: f64,
        /// Seed the sampler for reproducible output
        #[arg(long)]
        seed: Option<u64>,
    },
}

fn select_device(cuda: bool) -> anyhow::Result<Device> {
    if cuda {
        Ok(Device::new_cuda(0)?)
    } else {
        Ok(Device::Cpu)
    }
}

type Loader = PreferenceDataLoader<PairwiseDataCollator>;

fn build_split_loaders(
    data_path: &Path,
    batch_size: usize,
    max_length: usize,
    tokenizer: &tiktoken_rs::CoreBPE,
) -> anyhow::Result<(Loader, Loader, Loader)> {
    if let Some(parent) = data_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let data = download_and_load_file(data_path, PREFERENCE_DATA_URL)?;
    tracing::info!(num_examples = data.len(), "loaded preference data");

    let (train_data, val_data, test_data) = partition_data(data, 0.85_f32, 0.05_f32)?;
    let formatter = AlpacaPromptFormatter;
    let train_dataset = PreferenceDataset::new(train_data, tokenizer, &formatter)?;
    let val_dataset = PreferenceDataset::new(val_data, tokenizer, &formatter)?;
    let test_dataset = PreferenceDataset::new(test_data, tokenizer, &formatter)?;

    let collator = PairwiseDataCollator::new().allowed_max_length(Some(max_length));
    let train_loader =
        PreferenceDataLoader::new(train_dataset, batch_size, true, true, collator.clone());
    let val_loader =
        PreferenceDataLoader::new(val_dataset, batch_size, false, false, collator.clone());
    let test_loader = PreferenceDataLoader::new(test_dataset, batch_size, false, false, collator);
    Ok((train_loader, val_loader, test_loader))
}

#[allow(clippy::too_many_arguments)]
fn run_train(
    device: &Device,
    data: &Path,
    output: &Path,
    epochs: usize,
    batch_size: usize,
    lr: f64,
    max_length: usize,
    eval_freq: usize,
    eval_iter: usize,
    plot: Option<PathBuf>,
) -> anyhow::Result<()> {
    let tokenizer = get_bpe_from_model("gpt2")?;
    let cfg = Config::gpt2_124m();
    let max_length = max_length.min(cfg.context_length);
    let (train_loader, val_loader, test_loader) =
        build_split_loaders(data, batch_size, max_length, &tokenizer)?;

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let mut model = GPTModel::new(cfg, vb.pp("model"))?;
    modify_out_head_for_reward(&mut model, cfg, vb.pp("model"))?;

    let mut optimizer = AdamW::new(
        varmap.all_vars(),
        ParamsAdamW {
            lr,
            ..Default::default()
        },
    )?;

    let (train_losses, val_losses, pairs_seen) = train_reward_model(
        &model,
        &train_loader,
        &val_loader,
        &mut optimizer,
        &PairwiseLogisticLoss,
        device,
        epochs,
        eval_freq,
        eval_iter,
    )?;

    let train_acc =
        calc_reward_accuracy_loader(&train_loader, &model, &PairwiseLogisticLoss, device, None)?;
    let val_acc =
        calc_reward_accuracy_loader(&val_loader, &model, &PairwiseLogisticLoss, device, None)?;
    let test_acc =
        calc_reward_accuracy_loader(&test_loader, &model, &PairwiseLogisticLoss, device, None)?;
    println!(
        "{}",
        reward_accuracy_table(&[("train", train_acc), ("validation", val_acc), ("test", test_acc)])
    );

    varmap.save(output)?;
    tracing::info!(path = %output.display(), "saved reward model weights");

    if let Some(plot_path) = plot {
        plot_losses(epochs, pairs_seen, train_losses, val_losses, &plot_path);
        tracing::info!(path = %plot_path.display(), "wrote loss curves");
    }
    Ok(())
}

fn run_eval(
    device: &Device,
    data: &Path,
    checkpoint: &Path,
    batch_size: usize,
    max_length: usize,
) -> anyhow::Result<()> {
    let tokenizer = get_bpe_from_model("gpt2")?;
    let cfg = Config::gpt2_124m();
    let max_length = max_length.min(cfg.context_length);
    let (train_loader, val_loader, test_loader) =
        build_split_loaders(data, batch_size, max_length, &tokenizer)?;

    let mut varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let mut model = GPTModel::new(cfg, vb.pp("model"))?;
    modify_out_head_for_reward(&mut model, cfg, vb.pp("model"))?;
    varmap
        .load(checkpoint)
        .with_context(|| format!("Unable to load checkpoint {}", checkpoint.display()))?;

    let train_acc =
        calc_reward_accuracy_loader(&train_loader, &model, &PairwiseLogisticLoss, device, None)?;
    let val_acc =
        calc_reward_accuracy_loader(&val_loader, &model, &PairwiseLogisticLoss, device, None)?;
    let test_acc =
        calc_reward_accuracy_loader(&test_loader, &model, &PairwiseLogisticLoss, device, None)?;
    println!(
        "{}",
        reward_accuracy_table(&[("train", train_acc), ("validation", val_acc), ("test", test_acc)])
    );
    Ok(())
}

fn run_serve(device: &Device, addr: &str, checkpoint: Option<PathBuf>) -> anyhow::Result<()> {
    let cfg = Config::gpt2_124m();
    let mut varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let model = GPTModel::new(cfg, vb.pp("model"))?;
    if let Some(checkpoint) = checkpoint {
        varmap
            .load(&checkpoint)
            .with_context(|| format!("Unable to load checkpoint {}", checkpoint.display()))?;
    } else {
        tracing::warn!("no checkpoint given; serving an untrained model");
    }

    let state = ChatState {
        model: Arc::new(model),
        tokenizer: Arc::new(get_bpe_from_model("gpt2")?),
        context_length: cfg.context_length,
        device: device.clone(),
    };

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(serve(state, addr))
}

fn run_chat(
    device: &Device,
    checkpoint: Option<PathBuf>,
    max_length: usize,
    top_p: f32,
    temperature: f64,
    seed: Option<u64>,
) -> anyhow::Result<()> {
    let cfg = Config::gpt2_124m();
    let mut varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let model = GPTModel::new(cfg, vb.pp("model"))?;
    if let Some(checkpoint) = checkpoint {
        varmap
            .load(&checkpoint)
            .with_context(|| format!("Unable to load checkpoint {}", checkpoint.display()))?;
    } else {
        tracing::warn!("no checkpoint given; chatting with an untrained model");
    }

    let tokenizer = Arc::new(get_bpe_from_model("gpt2")?);
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let max_length = max_length.min(cfg.context_length);
    let mut history: Vec<ChatTurn> = vec![];

    println!("Type a message; `exit` quits, `clear` forgets the conversation.");
    let stdin = std::io::stdin();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let query = line.trim();
        if query.is_empty() {
            continue;
        }
        match query {
            "exit" | "quit" => break,
            "clear" => {
                history.clear();
                continue;
            }
            _ => {}
        }

        let prompt = build_chat_prompt(&history, query);
        let prompt_ids = tokenizer.encode_with_special_tokens(&prompt);
        if prompt_ids.len() >= max_length {
            println!("(conversation exceeds max_length; clearing history)");
            history.clear();
            continue;
        }
        let gen_cfg = GenerationConfig {
            max_new_tokens: max_length - prompt_ids.len(),
            context_size: cfg.context_length,
            temperature,
            top_p: Some(top_p),
            eos_id: Some(EOS_TOKEN_ID),
        };

        let (tx, rx) = sync_channel::<String>(32);
        let printer = std::thread::spawn(move || {
            let mut answer = String::new();
            for chunk in rx {
                print!("{chunk}");
                let _ = std::io::stdout().flush();
                answer.push_str(&chunk);
            }
            answer
        });

        let num_prompt_tokens = prompt_ids.len();
        let idx = candle_core::Tensor::from_vec(prompt_ids, (1, num_prompt_tokens), device)?;
        {
            let mut streamer = TextStreamer::new(Arc::clone(&tokenizer), tx);
            generate_text(&model, idx, &gen_cfg, &mut rng, Some(&mut streamer))?;
        }
        let answer = printer
            .join()
            .map_err(|_| anyhow::anyhow!("output thread panicked"))?;
        println!();

        history.push(ChatTurn {
            user: query.to_string(),
            assistant: answer,
        });
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let device = select_device(cli.cuda)?;

    match cli.command {
        Commands::Train {
            data,
            output,
            epochs,
            batch_size,
            lr,
            max_length,
            eval_freq,
            eval_iter,
            plot,
        } => run_train(
            &device, &data, &output, epochs, batch_size, lr, max_length, eval_freq, eval_iter,
            plot,
        ),
        Commands::Eval {
            data,
            checkpoint,
            batch_size,
            max_length,
        } => run_eval(&device, &data, &checkpoint, batch_size, max_length),
        Commands::Serve { addr, checkpoint } => run_serve(&device, &addr, checkpoint),
        Commands::Chat {
            checkpoint,
            max_length,
            top_p,
            temperature,
            seed,
        } => run_chat(&device, checkpoint, max_length, top_p, temperature, seed),
    }
}
