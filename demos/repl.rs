use msgexpr::{InvocationContext, MessageEngine, ObjectCollection, Spirit};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::panic;
use std::process;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Prints posts straight to the terminal
#[derive(Debug)]
struct ConsoleSpirit;

impl Spirit for ConsoleSpirit {
    fn post(&self, tag: &str, message: &str) {
        match tag {
            "error" => eprintln!("{message}"),
            _ => println!("{message}"),
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let result = panic::catch_unwind(|| {
        run_repl();
    });

    if let Err(panic_info) = result {
        eprintln!("The REPL encountered an unexpected error and must exit.");

        if let Some(msg) = panic_info.downcast_ref::<&str>() {
            eprintln!("Error: {msg}");
        } else if let Some(msg) = panic_info.downcast_ref::<String>() {
            eprintln!("Error: {msg}");
        } else {
            eprintln!("Error: Unknown panic occurred");
        }

        process::exit(1);
    }
}

struct Session {
    objects: ObjectCollection,
    spirit: Arc<dyn Spirit>,
    last: Option<InvocationContext>,
    print_step: bool,
    counter: usize,
}

impl Session {
    fn new() -> Self {
        Session {
            objects: ObjectCollection::new(),
            spirit: Arc::new(ConsoleSpirit),
            last: None,
            print_step: false,
            counter: 0,
        }
    }

    fn context(&self) -> InvocationContext {
        InvocationContext::builder()
            .input_objects(self.objects.clone())
            .spirit(Arc::clone(&self.spirit))
            .build()
    }

    fn eval(&mut self, line: &str) {
        let mut ctx = self.context();
        let mut engine = MessageEngine::new(line);
        let outcome = if self.print_step {
            engine.run_print_step(None, &mut ctx, false)
        } else {
            engine.run_here(&mut ctx, false)
        };
        match outcome {
            Ok(result) if result.is_error() => {
                if let Some(error) = result.get_error() {
                    println!("Error: {}", error.summarize());
                    if !error.unread.is_empty() {
                        println!("  at: {} <<< {}", error.read.trim_end(), error.unread.trim_start());
                    }
                }
            }
            Ok(result) => {
                // keep the binding made by `=>` and friends
                self.objects = ctx.input_objects().clone();
                self.counter += 1;
                println!("[{:03}] {} : {}", self.counter, result, result.get_typename());
                self.objects.push(self.counter.to_string(), result);
            }
            Err(e) => println!("Error: {e}"),
        }
        self.last = Some(ctx);
    }
}

fn run_repl() {
    println!("msgexpr message expression evaluator");
    println!("Enter messages like: 10 * (1 + 2 + 3)");
    println!("Type :help for more commands, or Ctrl+C to exit.");
    println!();

    let mut rl = DefaultEditor::new().expect("Could not initialize REPL");
    let mut session = Session::new();

    loop {
        match rl.readline("msgexpr> ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                let _ = rl.add_history_entry(line);

                match line {
                    ":help" => {
                        print_help();
                        continue;
                    }
                    ":vars" => {
                        print_objects(&session.objects);
                        continue;
                    }
                    ":types" => {
                        let ctx = session.context();
                        println!("{}", ctx.type_module().type_names().join(" "));
                        continue;
                    }
                    ":log" => {
                        match &session.last {
                            Some(ctx) => ctx.pprint_log(),
                            None => println!("Nothing evaluated yet."),
                        }
                        continue;
                    }
                    ":step" => {
                        session.print_step = !session.print_step;
                        println!("Step printing {}", if session.print_step { "on" } else { "off" });
                        continue;
                    }
                    ":quit" | ":exit" => {
                        println!("Goodbye!");
                        break;
                    }
                    _ => {}
                }

                session.eval(line);
            }

            Err(ReadlineError::Eof) | Err(ReadlineError::Interrupted) => {
                println!("Goodbye!");
                break;
            }
            Err(err) => {
                println!("Error: {err:?}");
                break;
            }
        }
    }
}

fn print_help() {
    println!("Commands:");
    println!("  :help   - Show this help message");
    println!("  :vars   - Show bound objects");
    println!("  :types  - Show registered types");
    println!("  :log    - Show the execution log of the last evaluation");
    println!("  :step   - Toggle printing each message before it runs");
    println!("  :quit   - Exit the interpreter");
    println!("  Ctrl+C  - Exit the interpreter");
    println!();
    println!("Results are bound as @1, @2, ... and @- is the latest one.");
    println!();
    println!("Examples:");
    println!("  1 add 2 add 3");
    println!("  GODZILLA slice: 1 -1");
    println!("  7FFF Int: 16");
    println!("  'a b c' Tuple map '@ upper'");
    println!("  42 => answer . @answer hex");
    println!();
    println!("Set RUST_LOG=msgexpr=debug to trace the engine.");
}

fn print_objects(objects: &ObjectCollection) {
    if objects.is_empty() {
        println!("No objects bound.");
        return;
    }
    for item in objects.items() {
        println!("  @{} = {} : {}", item.name, item.object, item.object.get_typename());
    }
}
