use dataverse_ops as dv;
use dv::report::ExecutionReport;
use std::error::Error;
use std::process;

fn finish_report(opts: &dv::Options, report: &ExecutionReport) {
    report.print_summary();
    if let Some(path) = &opts.report_json {
        match report.write_json(path) {
            Ok(()) => tracing::info!("report written to {}", path.display()),
            Err(err) => tracing::warn!("could not write report to {}: {err}", path.display()),
        }
    }
}

fn main() {
    let opts = dv::opts::parse_args();
    dv::logging::init(opts.verbose, &opts.settings.log_file);
    for arg in &opts.unknown {
        tracing::warn!("ignoring unknown argument {arg}");
    }

    let code = match dv::run(&opts) {
        Ok(report) => {
            finish_report(&opts, &report);
            0
        }
        Err(aborted) => {
            finish_report(&opts, &aborted.report);
            if let dv::OpsError::Declined(_) = aborted.error {
                tracing::warn!("{}", aborted.error);
            } else {
                tracing::error!("{aborted}");
                let mut source = aborted.source();
                while let Some(cause) = source {
                    tracing::error!("Caused by: {cause}");
                    source = cause.source();
                }
            }
            aborted.exit_code()
        }
    };
    process::exit(code);
}
