pub mod logging {
    use tracing_subscriber::EnvFilter;

    /// Maps the number of `-v` flags to a default filter directive.
    pub fn default_directive(verbose: u8) -> &'static str {
        match verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }

    /// Installs a stderr subscriber. `RUST_LOG` takes precedence over the
    /// verbosity flags.
    pub fn init(verbose: u8) {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

}

pub mod report {
    use corepin::CpuSet;
    use libc::pid_t;
    use owo_colors::OwoColorize;

    pub fn describe(set: &CpuSet) -> String {
        let n = set.count();
        format!("{set} ({n} cpu{})", if n == 1 { "" } else { "s" })
    }

    pub fn print_mask(label: &str, pid: pid_t, set: &CpuSet) {
        println!("{} pid {pid}: {}", label.blue(), describe(set).green());
    }

    #[cfg(test)]
    mod test {
        use corepin::CpuSet;

        #[test]
        fn describe() {
            assert_eq!(
                super::describe(&CpuSet::from_cpus([0, 1, 2, 3])),
                "0-3 (4 cpus)"
            );
            assert_eq!(super::describe(&CpuSet::from_cpus([2])), "2 (1 cpu)");
        }
    }
}
