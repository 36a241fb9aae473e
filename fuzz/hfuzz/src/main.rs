extern crate xex;
#[macro_use] extern crate honggfuzz;

fn main() {
    loop {
        fuzz!(|data: &[u8]| {
            let pe = xex::Xex::parse(data).and_then(|xex| xex.reconstruct());
            if let Ok(pe) = pe {
                xex::analyze(&pe, &xex::AnalysisOptions::default()).ok();
            }
        });
    }
}
