use proc_macro::TokenStream;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::{parse_macro_input, Attribute, Ident, ItemFn, LitInt, Token};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Arguments accepted by [`tokio_timeout_test`]:
/// `#[tokio_timeout_test]`, `#[tokio_timeout_test(10)]`,
/// `#[tokio_timeout_test(timeout = 10, paused)]`.
struct TestArgs {
    timeout_secs: u64,
    paused: bool,
}

impl Parse for TestArgs {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let mut args = TestArgs {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            paused: false,
        };
        while !input.is_empty() {
            if input.peek(LitInt) {
                args.timeout_secs = parse_secs(&input.parse::<LitInt>()?)?;
            } else {
                let ident: Ident = input.parse()?;
                match ident.to_string().as_str() {
                    "paused" => args.paused = true,
                    "timeout" => {
                        input.parse::<Token![=]>()?;
                        args.timeout_secs = parse_secs(&input.parse::<LitInt>()?)?;
                    }
                    other => {
                        return Err(syn::Error::new_spanned(
                            &ident,
                            format!("unknown tokio_timeout_test argument `{other}`"),
                        ));
                    }
                }
            }
            if !input.is_empty() {
                input.parse::<Token![,]>()?;
            }
        }
        Ok(args)
    }
}

fn parse_secs(lit: &LitInt) -> syn::Result<u64> {
    let secs: u64 = lit.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new_spanned(lit, "timeout must be greater than zero"));
    }
    Ok(secs)
}

/// Runs an async test on a dedicated current-thread runtime and fails it if
/// it does not finish within the wall-clock budget. With `paused`, the runtime
/// starts with tokio's clock paused so timer-driven logic runs instantly; the
/// wall-clock guard still applies.
#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let TestArgs {
        timeout_secs,
        paused,
    } = parse_macro_input!(attr as TestArgs);

    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }
    sig.asyncness = None;

    let filtered_attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_harness_attribute(attr))
        .collect();

    let runtime = if paused {
        quote! {
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .start_paused(true)
                .build()
                .expect("failed to build Tokio runtime")
        }
    } else {
        quote! {
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to build Tokio runtime")
        }
    };

    // Under a paused clock tokio's own timeout would auto-advance and fire
    // spuriously, so only the wall-clock guard bounds the test.
    let body = if paused {
        quote! { runtime.block_on(async move #block); }
    } else {
        quote! {
            runtime.block_on(async {
                tokio::time::timeout(timeout_duration, async move #block)
                    .await
                    .expect("test timed out");
            });
        }
    };

    TokenStream::from(quote! {
        #[test]
        #(#filtered_attrs)*
        #vis #sig {
            let timeout_duration = std::time::Duration::from_secs(#timeout_secs);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    let runtime = #runtime;
                    #body
                }));
                let _ = sender.send(result);
            });
            match receiver.recv_timeout(timeout_duration) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread failed before reporting result")
                }
            }
        }
    })
}

fn is_test_harness_attribute(attr: &Attribute) -> bool {
    let segments: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    matches!(
        segments.iter().map(String::as_str).collect::<Vec<_>>().as_slice(),
        ["test"] | ["tokio", "test"]
    )
}
