use clap::{Parser as ClapParser, ValueEnum};
use std::process;

use knot::{
    ClassInfo, Compilation, DumpOptions, FieldDescriptor, Handle, Heap, HeapCreateInfo, HeapError,
    Index, KnownObjectTable, LocalTable, Location, Store,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// compiler and heap in one process
    Local,
    /// compiler as server, heap owner as client on its own thread
    Split,
}

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Table topology to resolve the sample objects through
    #[arg(long, value_enum, default_value_t = Mode::Local)]
    mode: Mode,

    /// Print the known object graph after the table
    #[arg(long, help = "Print the <knownObjectGraph> block")]
    graph: bool,

    /// Show mutable reference fields in the graph
    #[arg(long, help = "Include mutable reference fields as graph children")]
    mutable_fields: bool,

    /// Run a collection between lookups
    #[arg(long, help = "Relocate the heap between lookups")]
    collect: bool,

    /// More logging, repeat for trace
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    let heap = match Heap::new(HeapCreateInfo::default()) {
        Ok(heap) => heap,
        Err(err) => {
            eprintln!("Error creating heap: {}", err);
            process::exit(1);
        }
    };
    let sample = match Sample::build(&heap) {
        Ok(sample) => sample,
        Err(err) => {
            eprintln!("Error building sample objects: {}", err);
            process::exit(1);
        }
    };

    let options = DumpOptions {
        graph: cli.graph,
        include_mutable_fields: cli.mutable_fields,
    };

    match cli.mode {
        Mode::Local => run_local(&heap, &sample, cli.collect, &options),
        Mode::Split => run_split(&heap, &sample, cli.collect, &options),
    }
}

/// A small object graph in the shape a compiler meets around call sites.
///
/// `handle.form` and `form.owner` are final fields forming a cycle,
/// `site.target` is mutable and `elements` is an array of constants.
struct Sample {
    site: Handle,
    handle: Handle,
    elements: Handle,
}

const SITE_TARGET: usize = 0;
const HANDLE_TYPE: usize = 0;
const HANDLE_FORM: usize = 1;

impl Sample {
    fn build(heap: &Heap) -> Result<Self, HeapError> {
        let call_site = heap.define_class(
            ClassInfo::new("knot/sample/CallSite")
                .field(FieldDescriptor::new("target", "Lknot/sample/MethodHandle;")),
        );
        let method_handle = heap.define_class(
            ClassInfo::new("knot/sample/MethodHandle")
                .field(FieldDescriptor::new("type", "Lknot/sample/MethodType;").immutable())
                .field(FieldDescriptor::new("form", "Lknot/sample/LambdaForm;").immutable())
                .field(FieldDescriptor::new("arity", "I").immutable()),
        );
        let method_type = heap.define_class(
            ClassInfo::new("knot/sample/MethodType")
                .field(FieldDescriptor::new("slots", "I").immutable()),
        );
        let lambda_form = heap.define_class(
            ClassInfo::new("knot/sample/LambdaForm")
                .field(FieldDescriptor::new("owner", "Lknot/sample/MethodHandle;").immutable())
                .field(FieldDescriptor::new("customized", "I")),
        );
        let object_array = heap.define_class(ClassInfo::array("[Ljava/lang/Object;"));

        let site = heap.allocate(call_site);
        let handle = heap.allocate(method_handle);
        let kind = heap.allocate(method_type);
        let form = heap.allocate(lambda_form);
        let elements = heap.allocate(object_array);

        heap.store(site, "target", Store::Ref(handle))?;
        heap.store(handle, "type", Store::Ref(kind))?;
        heap.store(handle, "form", Store::Ref(form))?;
        heap.store(handle, "arity", Store::Int(2))?;
        heap.store(kind, "slots", Store::Int(3))?;
        heap.store(form, "owner", Store::Ref(handle))?;
        heap.store(form, "customized", Store::Int(0))?;

        Ok(Self {
            site,
            handle,
            elements,
        })
    }

    /// What a compiler pass would ask for, in discovery order.
    fn lookups(&self) -> Vec<(&'static str, Location, bool)> {
        vec![
            ("site", Location::Handle(self.site), false),
            (
                "site.target",
                Location::Field {
                    holder: self.site,
                    field: SITE_TARGET,
                },
                false,
            ),
            (
                "handle.form",
                Location::Field {
                    holder: self.handle,
                    field: HANDLE_FORM,
                },
                false,
            ),
            (
                "handle.type",
                Location::Field {
                    holder: self.handle,
                    field: HANDLE_TYPE,
                },
                false,
            ),
            ("elements", Location::Handle(self.elements), true),
            ("handle", Location::Handle(self.handle), false),
        ]
    }
}

fn resolve(
    table: &mut impl KnownObjectTable,
    heap: &Heap,
    sample: &Sample,
    collect: bool,
) -> Vec<(&'static str, Index)> {
    let mut resolved = Vec::new();
    for (name, location, constant_elements) in sample.lookups() {
        let index = table.index_at_with_constant_elements(&location, constant_elements);
        log::info!("{name} -> obj{index}");
        resolved.push((name, index));
        if collect {
            heap.collect();
        }
    }
    resolved
}

fn print_resolved(resolved: &[(&str, Index)]) {
    for (name, index) in resolved {
        println!("{:<12} obj{}", name, index);
    }
}

fn dump_table(table: &impl KnownObjectTable, options: &DumpOptions) -> String {
    let mut out = String::new();
    if let Err(err) = table.dump(&mut out, options) {
        eprintln!("Error dumping table: {}", err);
    }
    out
}

fn run_local(heap: &Heap, sample: &Sample, collect: bool, options: &DumpOptions) {
    let compilation = Compilation::new(LocalTable::new(heap));
    match compilation.run(|table| resolve(table, heap, sample, collect)) {
        Ok(finished) => {
            print_resolved(&finished.output);
            print!("{}", finished.dump_known_objects(options));
        }
        Err(err) => {
            eprintln!("{}", err);
            process::exit(1);
        }
    }
}

#[cfg(unix)]
fn run_split(heap: &Heap, sample: &Sample, collect: bool, options: &DumpOptions) {
    use std::{os::unix::net::UnixStream, thread};

    use knot::{ClientTable, RemoteTable, StreamChannel, serve_stream};

    let (server_end, client_end) = match UnixStream::pair() {
        Ok(pair) => pair,
        Err(err) => {
            eprintln!("Error opening channel: {}", err);
            process::exit(1);
        }
    };

    let client_heap = heap.clone();
    let client = thread::Builder::new()
        .name("knot-client".into())
        .spawn(move || {
            let mut client = ClientTable::new(&client_heap);
            let served = serve_stream(&mut client, client_end);
            (client, served)
        })
        .expect("spawn client");

    let compilation = Compilation::new(RemoteTable::new(StreamChannel::new(server_end)));
    let result = compilation.run(|table| resolve(table, heap, sample, collect));
    // dropping the server table closes the channel and ends the client loop
    let outcome = result.map(|finished| {
        print_resolved(&finished.output);
        finished.dump_known_objects(options)
    });

    let (client, served) = client.join().expect("client thread");
    if let Err(err) = served {
        eprintln!("Client channel failed: {}", err);
    }

    match outcome {
        Ok(server_dump) => {
            print!("{}", server_dump);
            print!("{}", dump_table(&client, options));
        }
        Err(err) => {
            eprintln!("{}", err);
            process::exit(1);
        }
    }
}

#[cfg(not(unix))]
fn run_split(heap: &Heap, sample: &Sample, collect: bool, options: &DumpOptions) {
    use knot::{ClientTable, Loopback, RemoteTable};

    let mut client = ClientTable::new(heap);
    let compilation = Compilation::new(RemoteTable::new(Loopback::new(&mut client)));
    let outcome = compilation
        .run(|table| resolve(table, heap, sample, collect))
        .map(|finished| {
            print_resolved(&finished.output);
            finished.dump_known_objects(options)
        });

    match outcome {
        Ok(server_dump) => {
            print!("{}", server_dump);
            print!("{}", dump_table(&client, options));
        }
        Err(err) => {
            eprintln!("{}", err);
            process::exit(1);
        }
    }
}
