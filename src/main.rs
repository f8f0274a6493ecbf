use graphdef_compiler::{
    Compiler, ExecutionOptions, ExpressionBuilder, FunctionRequest, NDArrayRuntime, Variable,
    Workspace,
};
use ndarray::{ArrayD, IxDyn};
use std::path::Path;
use std::sync::Arc;

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let options = match std::env::args().nth(1) {
        Some(path) => ExecutionOptions::from_json_file(Path::new(&path))?,
        None => ExecutionOptions::default(),
    };

    let workspace = Arc::new(Workspace::new());
    let runtime = Arc::new(NDArrayRuntime::new(workspace.clone()));
    let compiler = Compiler::new(workspace, runtime).with_options(options);
    let builder = ExpressionBuilder::new();

    let x = Variable::new("x");
    let y = builder.scale(&x, 2.0);
    let function = compiler.compile(FunctionRequest::new().inputs([x]).outputs([y]))?;

    println!("{}", serde_json::to_string_pretty(function.graph_def())?);

    for (name, value) in function.call([ArrayD::<f32>::ones(IxDyn(&[2, 3]))])? {
        log::info!("{name} = {value}");
        println!("{name}:\n{value}");
    }
    Ok(())
}
